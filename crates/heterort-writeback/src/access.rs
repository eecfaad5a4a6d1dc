//! Access modes and the events recorded when an accessor is created.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Context id 0 is reserved for the host.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Access mode requested by an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Write without reading prior contents.
    DiscardWrite,
    /// Read-write without reading prior contents.
    DiscardReadWrite,
}

impl AccessMode {
    /// Every access mode, in declaration order.
    pub const ALL: [AccessMode; 5] = [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::ReadWrite,
        AccessMode::DiscardWrite,
        AccessMode::DiscardReadWrite,
    ];

    /// Whether an access in this mode may modify the buffer.
    ///
    /// Discard modes count as writes: skipping the initial read is only a
    /// hint, the data is still overwritten.
    pub const fn is_write_capable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite | Self::DiscardWrite | Self::DiscardReadWrite)
    }

    /// Whether an access in this mode leaves the accessor holding current data.
    ///
    /// Not the complement of [`is_write_capable`](Self::is_write_capable):
    /// `DiscardWrite` is write-only, `Read` is read-only, and the two
    /// read-write modes are both.
    pub const fn is_read_capable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite | Self::DiscardReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::ReadWrite => write!(f, "read_write"),
            Self::DiscardWrite => write!(f, "discard_write"),
            Self::DiscardReadWrite => write!(f, "discard_read_write"),
        }
    }
}

impl std::str::FromStr for AccessMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "read_write" => Ok(Self::ReadWrite),
            "discard_write" => Ok(Self::DiscardWrite),
            "discard_read_write" => Ok(Self::DiscardReadWrite),
            other => Err(format!("unknown access mode: {other}")),
        }
    }
}

/// Where an access originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessOrigin {
    /// A host accessor (blocking, mapped into host memory).
    Host,
    /// An accessor inside a command group queued to a device.
    Device,
}

impl AccessOrigin {
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }
}

/// The device/queue environment an access ran in.
///
/// Opaque token compared by equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext(u64);

impl ExecutionContext {
    /// Allocate a fresh, process-unique context token.
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The reserved host context.
    pub const fn host() -> Self {
        Self(0)
    }

    /// Wrap an externally assigned id (e.g. a backend context handle).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_host(self) -> bool {
        self.0 == 0
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() { write!(f, "ctx:host") } else { write!(f, "ctx:{}", self.0) }
    }
}

/// One accessor acquisition against a buffer or sub-buffer.
///
/// Events are ordered by when the accessor was created, not by when the
/// device work using it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub origin: AccessOrigin,
    pub mode: AccessMode,
    /// `None` for pure host accesses or when the context was not yet known.
    pub context: Option<ExecutionContext>,
}

impl AccessEvent {
    pub const fn host(mode: AccessMode) -> Self {
        Self { origin: AccessOrigin::Host, mode, context: None }
    }

    pub const fn device(mode: AccessMode, context: ExecutionContext) -> Self {
        Self { origin: AccessOrigin::Device, mode, context: Some(context) }
    }

    /// A device access that modified the buffer. The newest such event names
    /// the context holding the data the host is missing.
    pub const fn is_device_write(&self) -> bool {
        !self.origin.is_host() && self.mode.is_write_capable()
    }

    /// A host access that left the host with a current view.
    pub const fn is_host_read(&self) -> bool {
        self.origin.is_host() && self.mode.is_read_capable()
    }
}
