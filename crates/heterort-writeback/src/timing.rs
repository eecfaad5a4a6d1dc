//! Timing-oriented view of the write-back decision.
//!
//! [`WriteBackTiming`] says at which point a buffer's host memory gets
//! refreshed: right away when a host accessor maps it, at teardown, or not
//! at all. [`should_write_back`] combines that with the point the caller is
//! currently at and the user's override.

use std::fmt;

use crate::record::WriteBackPolicy;

/// When host memory is brought up to date for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteBackTiming {
    /// The newest access was a host read; the map operation already copied.
    Immediate,
    /// A device wrote and the host has not read since; copy at teardown.
    OnTeardown,
    /// Nothing ever wrote from a device.
    Never,
}

/// The point in a buffer's life at which a caller asks for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteBackTrigger {
    /// While scheduling a command group (host accessor creation).
    Immediate,
    /// During buffer or sub-buffer destruction.
    Teardown,
    /// Either; asks whether a copy happens at any stage.
    Undetermined,
}

impl fmt::Display for WriteBackTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::OnTeardown => write!(f, "on_teardown"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl fmt::Display for WriteBackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Teardown => write!(f, "teardown"),
            Self::Undetermined => write!(f, "undetermined"),
        }
    }
}

/// Decide whether a copy back to host memory happens at `trigger`.
///
/// The immediate path belongs to host accessor creation, which never
/// consults the write-back override, so it is checked before the policy.
pub fn should_write_back(
    policy: WriteBackPolicy,
    timing: WriteBackTiming,
    trigger: WriteBackTrigger,
) -> bool {
    if trigger == WriteBackTrigger::Immediate && timing == WriteBackTiming::Immediate {
        return true;
    }
    if policy.is_forced_off() {
        return false;
    }
    match trigger {
        WriteBackTrigger::Undetermined => timing != WriteBackTiming::Never,
        WriteBackTrigger::Immediate => timing == WriteBackTiming::Immediate,
        WriteBackTrigger::Teardown => timing == WriteBackTiming::OnTeardown,
    }
}
