//! Newest-first access history and the scans that decide write-back.
//!
//! A history is never pruned. Every decision is a scan from the newest
//! event towards the oldest that stops at the first *consequential* event:
//!
//! - a device access in a write-capable mode: the device holds data the
//!   host has not seen, so write-back is needed;
//! - a host access in a read-capable mode: the host was brought up to date
//!   when it mapped the buffer, so nothing needs copying.
//!
//! Anything else (device reads, host writes, host discard-writes) is
//! skipped. Running off the end of the history means no device ever wrote.

use std::collections::VecDeque;

use crate::access::{AccessEvent, ExecutionContext};
use crate::timing::WriteBackTiming;

/// Result of scanning a history for the first consequential event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    /// A device wrote after the host last read. Carries that event's context.
    DeviceWrite { context: Option<ExecutionContext>, age: usize },
    /// The host read after the last device write.
    HostCurrent { age: usize },
    /// No consequential event in the history.
    Inconclusive,
}

impl ScanVerdict {
    pub const fn needs_write_back(&self) -> bool {
        matches!(self, Self::DeviceWrite { .. })
    }
}

/// Accessor history for one buffer or sub-buffer, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessHistory {
    events: VecDeque<AccessEvent>,
}

impl AccessHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the history; `capacity` is an allocation hint only.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: VecDeque::with_capacity(capacity) }
    }

    /// Record an event as the newest entry.
    pub fn push(&mut self, event: AccessEvent) {
        self.events.push_front(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn newest(&self) -> Option<&AccessEvent> {
        self.events.front()
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &AccessEvent> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<AccessEvent> {
        self.events.iter().copied().collect()
    }

    /// Find the first consequential event.
    pub fn scan(&self) -> ScanVerdict {
        for (age, event) in self.events.iter().enumerate() {
            if event.is_device_write() {
                return ScanVerdict::DeviceWrite { context: event.context, age };
            }
            if event.is_host_read() {
                return ScanVerdict::HostCurrent { age };
            }
        }
        ScanVerdict::Inconclusive
    }

    /// Whether the newest consequential event is a device write.
    pub fn needs_write_back(&self) -> bool {
        self.scan().needs_write_back()
    }

    /// Context of the newest device write, ignoring host events.
    ///
    /// Only meaningful once [`needs_write_back`](Self::needs_write_back)
    /// returned true; in that case the newest device write is the event the
    /// scan stopped at, so both answers agree.
    pub fn last_device_writer(&self) -> Option<ExecutionContext> {
        self.events.iter().find(|e| e.is_device_write()).and_then(|e| e.context)
    }

    /// When, if ever, this history requires host memory to be refreshed.
    pub fn timing(&self) -> WriteBackTiming {
        match self.newest() {
            None => WriteBackTiming::Never,
            Some(newest) if newest.is_host_read() => WriteBackTiming::Immediate,
            Some(_) if self.events.iter().any(AccessEvent::is_device_write) => {
                WriteBackTiming::OnTeardown
            }
            Some(_) => WriteBackTiming::Never,
        }
    }
}

impl FromIterator<AccessEvent> for AccessHistory {
    /// Build from events given oldest first, as they would be recorded.
    fn from_iter<I: IntoIterator<Item = AccessEvent>>(iter: I) -> Self {
        let mut history = Self::new();
        for event in iter {
            history.push(event);
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;

    fn ctx(raw: u64) -> ExecutionContext {
        ExecutionContext::from_raw(raw)
    }

    #[test]
    fn empty_history_is_inconclusive() {
        let h = AccessHistory::new();
        assert_eq!(h.scan(), ScanVerdict::Inconclusive);
        assert!(!h.needs_write_back());
        assert_eq!(h.last_device_writer(), None);
        assert_eq!(h.timing(), WriteBackTiming::Never);
    }

    #[test]
    fn push_keeps_newest_first() {
        let mut h = AccessHistory::new();
        h.push(AccessEvent::host(AccessMode::Read));
        h.push(AccessEvent::device(AccessMode::Write, ctx(3)));
        assert_eq!(h.newest(), Some(&AccessEvent::device(AccessMode::Write, ctx(3))));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn host_read_after_device_write_stops_scan() {
        // Recorded oldest first: device write, then host read.
        let h: AccessHistory = [
            AccessEvent::device(AccessMode::Write, ctx(1)),
            AccessEvent::host(AccessMode::Read),
        ]
        .into_iter()
        .collect();
        assert_eq!(h.scan(), ScanVerdict::HostCurrent { age: 0 });
        assert!(!h.needs_write_back());
    }

    #[test]
    fn device_write_after_host_read_needs_write_back() {
        let h: AccessHistory = [
            AccessEvent::host(AccessMode::Read),
            AccessEvent::device(AccessMode::Write, ctx(7)),
        ]
        .into_iter()
        .collect();
        assert_eq!(h.scan(), ScanVerdict::DeviceWrite { context: Some(ctx(7)), age: 0 });
        assert_eq!(h.last_device_writer(), Some(ctx(7)));
    }

    #[test]
    fn inconsequential_events_are_skipped() {
        let h: AccessHistory = [
            AccessEvent::device(AccessMode::DiscardWrite, ctx(2)),
            AccessEvent::device(AccessMode::Read, ctx(9)),
            AccessEvent::host(AccessMode::Write),
            AccessEvent::host(AccessMode::DiscardWrite),
        ]
        .into_iter()
        .collect();
        assert_eq!(h.scan(), ScanVerdict::DeviceWrite { context: Some(ctx(2)), age: 3 });
    }

    #[test]
    fn host_discard_write_alone_is_inconclusive() {
        let h: AccessHistory = [AccessEvent::host(AccessMode::DiscardWrite)].into_iter().collect();
        assert_eq!(h.scan(), ScanVerdict::Inconclusive);
        assert_eq!(h.timing(), WriteBackTiming::Never);
    }

    #[test]
    fn timing_classification() {
        let immediate: AccessHistory = [
            AccessEvent::device(AccessMode::Write, ctx(1)),
            AccessEvent::host(AccessMode::ReadWrite),
        ]
        .into_iter()
        .collect();
        assert_eq!(immediate.timing(), WriteBackTiming::Immediate);

        // A host write on top of a device write does not refresh the host view.
        let teardown: AccessHistory = [
            AccessEvent::device(AccessMode::Write, ctx(1)),
            AccessEvent::host(AccessMode::Write),
        ]
        .into_iter()
        .collect();
        assert_eq!(teardown.timing(), WriteBackTiming::OnTeardown);

        let never: AccessHistory = [AccessEvent::device(AccessMode::Read, ctx(1))].into_iter().collect();
        assert_eq!(never.timing(), WriteBackTiming::Never);
    }
}
