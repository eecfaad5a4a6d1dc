//! Error types for write-back submission and configuration loading.
//!
//! Lifecycle misuse (unknown buffer ids, double registration, retiring a
//! buffer twice) is not represented here. Those are bugs in the calling
//! runtime and panic at the call site instead.

use crate::record::BufferId;

/// Errors reported by a [`ReadBackScheduler`](crate::scheduler::ReadBackScheduler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler refused to enqueue the request.
    #[error("read-back request rejected: {reason}")]
    Rejected { reason: String },

    /// The enqueued read-back finished with a backend error code.
    #[error("read-back failed with backend status {code}")]
    Failed { code: i32 },

    /// The scheduler went away before the request completed.
    #[error("scheduler disconnected")]
    Disconnected,
}

/// Errors surfaced by [`WriteBackEngine`](crate::engine::WriteBackEngine).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteBackError {
    /// The scheduler failed to submit or complete the copy back to host memory.
    #[error("write-back of buffer {buffer} failed: {source}")]
    Scheduler {
        buffer: BufferId,
        #[source]
        source: SchedulerError,
    },
}

impl WriteBackError {
    /// Attach the buffer id to a scheduler failure.
    pub fn scheduler(buffer: BufferId, source: SchedulerError) -> Self {
        Self::Scheduler { buffer, source }
    }

    /// The buffer whose write-back failed.
    pub fn buffer(&self) -> BufferId {
        match self {
            Self::Scheduler { buffer, .. } => *buffer,
        }
    }

    /// Backend status code, if the scheduler reported one.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Scheduler { source: SchedulerError::Failed { code }, .. } => Some(*code),
            Self::Scheduler { .. } => None,
        }
    }
}

/// Errors that can occur when loading or validating a
/// [`WriteBackConfig`](crate::config::WriteBackConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

/// Convenience result type for write-back operations.
pub type Result<T> = std::result::Result<T, WriteBackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_error_display_includes_buffer_and_code() {
        let err = WriteBackError::scheduler(BufferId::new(0x40), SchedulerError::Failed { code: -5 });
        let msg = err.to_string();
        assert!(msg.contains("0x40"), "got: {msg}");
        assert!(msg.contains("-5"), "got: {msg}");
        assert_eq!(err.status_code(), Some(-5));
        assert_eq!(err.buffer(), BufferId::new(0x40));
    }

    #[test]
    fn rejected_has_no_status_code() {
        let err = WriteBackError::scheduler(
            BufferId::new(1),
            SchedulerError::Rejected { reason: "queue closed".into() },
        );
        assert_eq!(err.status_code(), None);
        assert!(err.to_string().contains("queue closed"));
    }
}
