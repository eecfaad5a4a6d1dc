//! Host write-back decisions for buffers shared between host and devices.
//!
//! This crate provides:
//! - [`access`]: access modes and the per-accessor events that feed decisions
//! - [`history`]: newest-first access histories and the decision scan
//! - [`record`]: per-buffer records with geometry and a tri-state override
//! - [`timing`]: whether a copy back happens immediately, at teardown, or never
//! - [`engine`]: [`WriteBackEngine`], the registry and teardown hook
//! - [`scheduler`]: the [`ReadBackScheduler`] seam and completion handles
//! - [`config`]: TOML/env configuration
//! - [`error`]: structured error types
//!
//! # Example
//!
//! ```
//! use heterort_writeback::{
//!     AccessMode, BufferGeometry, BufferId, ExecutionContext, HostPtr, RecordingScheduler,
//!     WriteBackEngine, WriteBackOutcome,
//! };
//!
//! let engine = WriteBackEngine::new(RecordingScheduler::new());
//! let mut host = vec![0u8; 256];
//! let buf = BufferId::from_ptr(host.as_ptr());
//! engine.register_buffer(buf, BufferGeometry::buffer(host.len()));
//!
//! let gpu = ExecutionContext::new();
//! engine.record_host_access(buf, AccessMode::Read);
//! engine.record_device_access(buf, AccessMode::Write, gpu);
//! assert!(engine.needs_write_back(buf));
//! assert_eq!(engine.context_for_write_back(buf), Some(gpu));
//!
//! let outcome = engine.retire(buf, HostPtr::from_slice(&mut host), false).unwrap();
//! assert!(matches!(outcome, WriteBackOutcome::Pending(_)));
//! engine.scheduler().complete_all();
//! outcome.wait().unwrap();
//! ```

pub mod access;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod record;
pub mod scheduler;
pub mod timing;

// Re-export primary public types.
pub use access::{AccessEvent, AccessMode, AccessOrigin, ExecutionContext};
pub use config::WriteBackConfig;
pub use engine::{PendingWriteBack, SkipReason, WriteBackEngine, WriteBackOutcome};
pub use error::{ConfigError, Result, SchedulerError, WriteBackError};
pub use history::{AccessHistory, ScanVerdict};
pub use record::{BufferGeometry, BufferId, BufferRecord, RecordState, WriteBackPolicy};
pub use scheduler::{
    ByteRange, CompletionHandle, EventStatus, HostPtr, ReadBackRequest, ReadBackScheduler,
    RecordingScheduler, RequestId,
};
pub use timing::{WriteBackTiming, WriteBackTrigger, should_write_back};
