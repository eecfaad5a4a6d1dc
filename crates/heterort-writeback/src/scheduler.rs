//! The seam to the command scheduler that performs device-to-host copies.
//!
//! The engine only builds [`ReadBackRequest`]s and waits on the returned
//! [`CompletionHandle`]s. Enqueueing, dependency tracking and device
//! dispatch belong to the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::access::ExecutionContext;
use crate::error::SchedulerError;
use crate::record::BufferId;

/// Id of a submitted read-back.
pub type RequestId = u64;

/// Destination in host memory for a read-back.
///
/// Wraps the user's host pointer. The engine never reads or writes through
/// it; only the scheduler does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(*mut u8);

// SAFETY: HostPtr is an address handed through to the scheduler. The engine
// never dereferences it, so moving it between threads cannot race.
unsafe impl Send for HostPtr {}
// SAFETY: see above; shared references only expose the address.
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub const fn new(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    /// Point at the start of a host slice.
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self(slice.as_mut_ptr())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0
    }
}

/// Byte range of a (sub-)buffer within its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: usize,
    pub size: usize,
}

/// A request to copy device data back into host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBackRequest {
    pub buffer: BufferId,
    pub range: ByteRange,
    /// The context that last wrote this buffer; the copy's source.
    pub source: ExecutionContext,
    pub destination: HostPtr,
}

/// Status of a submitted read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Enqueued but not started.
    Queued,
    /// Copy in progress.
    Running,
    /// Copy finished successfully.
    Complete,
    /// Copy failed with a backend status code.
    Error(i32),
}

impl EventStatus {
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }
}

#[derive(Debug)]
struct EventState {
    status: Mutex<EventStatus>,
    finished: Condvar,
}

/// Handle to an in-flight read-back.
///
/// Clones share state; any clone may complete the event or wait on it.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    id: RequestId,
    state: Arc<EventState>,
}

impl CompletionHandle {
    /// Create a handle in `Queued` state.
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            state: Arc::new(EventState {
                status: Mutex::new(EventStatus::Queued),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, EventStatus> {
        self.state.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> EventStatus {
        *self.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn set_running(&self) {
        let mut status = self.lock();
        if !status.is_finished() {
            *status = EventStatus::Running;
        }
    }

    /// Mark the copy complete and wake all waiters. No-op once finished.
    pub fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    /// Mark the copy failed and wake all waiters. No-op once finished.
    pub fn fail(&self, code: i32) {
        self.finish(EventStatus::Error(code));
    }

    fn finish(&self, terminal: EventStatus) {
        let mut status = self.lock();
        if status.is_finished() {
            return;
        }
        *status = terminal;
        drop(status);
        self.state.finished.notify_all();
    }

    /// Block until the copy finishes. There is no timeout.
    pub fn wait(&self) -> Result<(), SchedulerError> {
        let mut status = self.lock();
        while !status.is_finished() {
            status = self
                .state
                .finished
                .wait(status)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match *status {
            EventStatus::Error(code) => Err(SchedulerError::Failed { code }),
            _ => Ok(()),
        }
    }
}

/// A command scheduler able to copy device data back to the host.
///
/// Abstracted so the engine can be driven without a device runtime.
pub trait ReadBackScheduler: Send + Sync {
    /// Enqueue a copy of `request.range` from `request.source` into
    /// `request.destination`.
    fn submit_read_back(&self, request: ReadBackRequest) -> Result<CompletionHandle, SchedulerError>;

    /// Block until `handle` completes.
    fn wait(&self, handle: &CompletionHandle) -> Result<(), SchedulerError> {
        handle.wait()
    }
}

impl<S: ReadBackScheduler + ?Sized> ReadBackScheduler for Arc<S> {
    fn submit_read_back(&self, request: ReadBackRequest) -> Result<CompletionHandle, SchedulerError> {
        (**self).submit_read_back(request)
    }

    fn wait(&self, handle: &CompletionHandle) -> Result<(), SchedulerError> {
        (**self).wait(handle)
    }
}

/// In-process scheduler that records requests and leaves them queued.
///
/// Completion is driven by the caller through [`complete`](Self::complete),
/// [`fail`](Self::fail) or [`complete_all`](Self::complete_all), typically
/// from another thread while the engine blocks.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    next_id: AtomicU64,
    submitted: Mutex<Vec<(ReadBackRequest, CompletionHandle)>>,
    by_id: Mutex<HashMap<RequestId, CompletionHandle>>,
    reject_reason: Mutex<Option<String>>,
    submitted_cv: Condvar,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every following submission with `reason`.
    pub fn reject_with(&self, reason: impl Into<String>) {
        *lock(&self.reject_reason) = Some(reason.into());
    }

    /// Accept submissions again.
    pub fn accept(&self) {
        *lock(&self.reject_reason) = None;
    }

    /// All requests submitted so far, oldest first.
    pub fn requests(&self) -> Vec<ReadBackRequest> {
        lock(&self.submitted).iter().map(|(req, _)| *req).collect()
    }

    pub fn submitted_count(&self) -> usize {
        lock(&self.submitted).len()
    }

    pub fn handle(&self, id: RequestId) -> Option<CompletionHandle> {
        lock(&self.by_id).get(&id).cloned()
    }

    /// Block until at least `count` requests have been submitted.
    pub fn wait_for_submissions(&self, count: usize) {
        let mut submitted = lock(&self.submitted);
        while submitted.len() < count {
            submitted = self
                .submitted_cv
                .wait(submitted)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Complete request `id`. Returns `false` if no such request exists.
    pub fn complete(&self, id: RequestId) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        handle.set_running();
        handle.complete();
        true
    }

    /// Fail request `id` with `code`. Returns `false` if no such request exists.
    pub fn fail(&self, id: RequestId, code: i32) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        handle.fail(code);
        true
    }

    /// Complete every unfinished request, returning how many were completed.
    pub fn complete_all(&self) -> usize {
        let handles: Vec<CompletionHandle> = lock(&self.by_id).values().cloned().collect();
        let mut completed = 0;
        for handle in handles.iter().filter(|h| !h.is_finished()) {
            handle.complete();
            completed += 1;
        }
        completed
    }
}

impl ReadBackScheduler for RecordingScheduler {
    fn submit_read_back(&self, request: ReadBackRequest) -> Result<CompletionHandle, SchedulerError> {
        if let Some(reason) = lock(&self.reject_reason).clone() {
            return Err(SchedulerError::Rejected { reason });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = CompletionHandle::new(id);
        lock(&self.by_id).insert(id, handle.clone());
        lock(&self.submitted).push((request, handle.clone()));
        self.submitted_cv.notify_all();
        tracing::trace!(request_id = id, buffer = %request.buffer, source = %request.source, "read-back recorded");
        Ok(handle)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn request() -> ReadBackRequest {
        ReadBackRequest {
            buffer: BufferId::new(0x10),
            range: ByteRange { offset: 0, size: 16 },
            source: ExecutionContext::from_raw(3),
            destination: HostPtr::null(),
        }
    }

    #[test]
    fn new_handle_is_queued() {
        let h = CompletionHandle::new(1);
        assert_eq!(h.status(), EventStatus::Queued);
        assert!(!h.is_finished());
    }

    #[test]
    fn complete_is_terminal() {
        let h = CompletionHandle::new(1);
        h.complete();
        h.fail(-1);
        assert_eq!(h.status(), EventStatus::Complete);
        assert!(h.wait().is_ok());
    }

    #[test]
    fn wait_reports_failure_code() {
        let h = CompletionHandle::new(2);
        h.fail(-42);
        assert_eq!(h.wait(), Err(SchedulerError::Failed { code: -42 }));
    }

    #[test]
    fn wait_blocks_until_completed_from_another_thread() {
        let h = CompletionHandle::new(3);
        let completer = h.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete();
        });
        h.wait().unwrap();
        assert_eq!(h.status(), EventStatus::Complete);
        t.join().unwrap();
    }

    #[test]
    fn recording_scheduler_assigns_increasing_ids() {
        let s = RecordingScheduler::new();
        let a = s.submit_read_back(request()).unwrap();
        let b = s.submit_read_back(request()).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(s.submitted_count(), 2);
        assert!(s.complete(1));
        assert!(!s.complete(99));
        assert_eq!(s.complete_all(), 1);
        assert!(b.is_finished());
    }

    #[test]
    fn recording_scheduler_rejects_when_told() {
        let s = RecordingScheduler::new();
        s.reject_with("device lost");
        let err = s.submit_read_back(request()).unwrap_err();
        assert_eq!(err, SchedulerError::Rejected { reason: "device lost".into() });
        s.accept();
        assert!(s.submit_read_back(request()).is_ok());
    }
}
