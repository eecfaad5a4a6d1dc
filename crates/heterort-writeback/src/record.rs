//! Per-buffer bookkeeping: identity, geometry, override and history.

use std::fmt;

use crate::access::{AccessEvent, ExecutionContext};
use crate::history::{AccessHistory, ScanVerdict};
use crate::timing::WriteBackTiming;

/// Identity of a buffer or sub-buffer.
///
/// Usually the address of the owning buffer object. Only compared, never
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Use the address of `ptr` as the identity.
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<()>() as usize)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte extent of a buffer, or of a sub-buffer within its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferGeometry {
    pub size_bytes: usize,
    /// Always 0 for whole buffers.
    pub offset_bytes: usize,
    pub is_sub_buffer: bool,
}

impl BufferGeometry {
    pub const fn buffer(size_bytes: usize) -> Self {
        Self { size_bytes, offset_bytes: 0, is_sub_buffer: false }
    }

    pub const fn sub_buffer(size_bytes: usize, offset_bytes: usize) -> Self {
        Self { size_bytes, offset_bytes, is_sub_buffer: true }
    }

    /// One past the last byte covered.
    pub const fn end(&self) -> usize {
        self.offset_bytes.saturating_add(self.size_bytes)
    }

    pub const fn overlaps(&self, other: &BufferGeometry) -> bool {
        self.offset_bytes < other.end() && other.offset_bytes < self.end()
    }
}

/// User override of the write-back decision.
///
/// "Never set" must stay distinguishable from "set to false".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteBackPolicy {
    ForcedOff,
    #[default]
    NotSet,
    ForcedOn,
}

impl WriteBackPolicy {
    pub const fn from_flag(enabled: bool) -> Self {
        if enabled { Self::ForcedOn } else { Self::ForcedOff }
    }

    pub const fn is_forced_off(self) -> bool {
        matches!(self, Self::ForcedOff)
    }

    pub const fn is_set(self) -> bool {
        !matches!(self, Self::NotSet)
    }
}

impl fmt::Display for WriteBackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedOff => write!(f, "forced_off"),
            Self::NotSet => write!(f, "not_set"),
            Self::ForcedOn => write!(f, "forced_on"),
        }
    }
}

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Registered; accepts new access events.
    Active,
    /// The teardown decision has been made.
    Retired,
}

/// Everything tracked for one buffer or sub-buffer.
///
/// A retired record still answers queries but accepts no further events.
#[derive(Debug, Clone)]
pub struct BufferRecord {
    id: BufferId,
    geometry: BufferGeometry,
    parent: Option<BufferId>,
    policy: WriteBackPolicy,
    history: AccessHistory,
    state: RecordState,
}

impl BufferRecord {
    pub fn new(id: BufferId, geometry: BufferGeometry, history_capacity: usize) -> Self {
        Self {
            id,
            geometry,
            parent: None,
            policy: WriteBackPolicy::NotSet,
            history: AccessHistory::with_capacity(history_capacity),
            state: RecordState::Active,
        }
    }

    pub(crate) fn with_parent(mut self, parent: BufferId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn parent(&self) -> Option<BufferId> {
        self.parent
    }

    pub fn policy(&self) -> WriteBackPolicy {
        self.policy
    }

    pub fn history(&self) -> &AccessHistory {
        &self.history
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_retired(&self) -> bool {
        self.state == RecordState::Retired
    }

    /// Last write wins.
    pub fn set_policy(&mut self, policy: WriteBackPolicy) {
        self.policy = policy;
    }

    /// Append an access as the newest event.
    ///
    /// # Panics
    ///
    /// If the record has been retired.
    #[track_caller]
    pub fn record(&mut self, event: AccessEvent) {
        assert!(
            !self.is_retired(),
            "access recorded on retired buffer {} ({} {:?})",
            self.id,
            event.mode,
            event.origin
        );
        self.history.push(event);
    }

    /// Mark the teardown decision as made.
    ///
    /// # Panics
    ///
    /// If the record was already retired.
    #[track_caller]
    pub fn retire(&mut self) {
        assert!(!self.is_retired(), "buffer {} retired twice", self.id);
        self.state = RecordState::Retired;
    }

    /// The teardown decision. A forced-off override wins over any history.
    pub fn needs_write_back(&self) -> bool {
        if self.policy.is_forced_off() {
            return false;
        }
        self.history.needs_write_back()
    }

    /// Context whose data must be copied back, or `None` when no write-back
    /// is needed.
    pub fn context_for_write_back(&self) -> Option<ExecutionContext> {
        if !self.needs_write_back() {
            return None;
        }
        match self.history.scan() {
            ScanVerdict::DeviceWrite { context, .. } => context,
            _ => None,
        }
    }

    pub fn timing(&self) -> WriteBackTiming {
        self.history.timing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;

    fn record() -> BufferRecord {
        BufferRecord::new(BufferId::new(0x1000), BufferGeometry::buffer(256), 4)
    }

    #[test]
    fn new_record_is_active_unset_and_empty() {
        let r = record();
        assert_eq!(r.state(), RecordState::Active);
        assert_eq!(r.policy(), WriteBackPolicy::NotSet);
        assert!(r.history().is_empty());
        assert!(!r.needs_write_back());
    }

    #[test]
    fn forced_off_short_circuits_device_write() {
        let mut r = record();
        r.record(AccessEvent::device(AccessMode::Write, ExecutionContext::from_raw(5)));
        assert!(r.needs_write_back());
        r.set_policy(WriteBackPolicy::ForcedOff);
        assert!(!r.needs_write_back());
        assert_eq!(r.context_for_write_back(), None);
    }

    #[test]
    fn policy_last_write_wins() {
        let mut r = record();
        r.set_policy(WriteBackPolicy::from_flag(false));
        r.set_policy(WriteBackPolicy::from_flag(true));
        assert_eq!(r.policy(), WriteBackPolicy::ForcedOn);
    }

    #[test]
    #[should_panic(expected = "retired twice")]
    fn double_retire_panics() {
        let mut r = record();
        r.retire();
        r.retire();
    }

    #[test]
    #[should_panic(expected = "retired buffer")]
    fn record_after_retire_panics() {
        let mut r = record();
        r.retire();
        r.record(AccessEvent::host(AccessMode::Read));
    }

    #[test]
    fn geometry_overlap() {
        let a = BufferGeometry::sub_buffer(64, 0);
        let b = BufferGeometry::sub_buffer(64, 32);
        let c = BufferGeometry::sub_buffer(64, 64);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(BufferGeometry::buffer(10).end(), 10);
    }

    #[test]
    fn buffer_id_from_ptr_is_stable() {
        let value = 7u32;
        let a = BufferId::from_ptr(&value as *const u32);
        let b = BufferId::from_ptr(&value as *const u32);
        assert_eq!(a, b);
        assert_eq!(BufferId::new(255).to_string(), "0xff");
    }
}
