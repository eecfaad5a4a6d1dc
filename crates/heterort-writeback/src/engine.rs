//! The write-back decision engine.
//!
//! Buffers and sub-buffers register a [`BufferRecord`] at construction,
//! append an event per accessor, and hand the record back at teardown via
//! [`WriteBackEngine::retire`]. If the newest consequential access was a
//! device write, the engine asks the scheduler to copy that device's data
//! into the user's host memory.
//!
//! # Locking
//!
//! The registry lock is held only to look up or insert a record. Each
//! record has its own mutex that serialises appends and scans, so history
//! order matches the order in which callers acquired it. Scheduler
//! submission and any blocking wait happen after the record lock is
//! released.
//!
//! The copy's source context travels inside the [`ReadBackRequest`]; no
//! buffer-wide "current context" is swapped in and out, so concurrent
//! write-backs of sibling sub-buffers cannot clobber each other.
//!
//! # Panics
//!
//! Lifecycle misuse is a bug in the calling runtime and panics: touching an
//! unregistered id, registering an id that is still active, retiring twice,
//! recording after retirement, and a required write-back whose newest
//! device write carries no context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace, warn};

use crate::access::{AccessEvent, AccessMode, AccessOrigin, ExecutionContext};
use crate::config::WriteBackConfig;
use crate::error::{Result, SchedulerError, WriteBackError};
use crate::record::{BufferGeometry, BufferId, BufferRecord, RecordState, WriteBackPolicy};
use crate::scheduler::{ByteRange, CompletionHandle, HostPtr, ReadBackRequest, ReadBackScheduler};
use crate::timing::{self, WriteBackTiming, WriteBackTrigger};

/// Why a write-back was not submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The user disabled write-back for this buffer.
    ForcedOff,
    /// No device wrote since the host last read.
    HostCurrent,
    /// The destination host pointer is null.
    NullDestination,
    /// The record was retired; its teardown already decided the write-back.
    Retired,
}

/// A submitted write-back the caller has not waited on yet.
#[derive(Debug, Clone)]
pub struct PendingWriteBack {
    buffer: BufferId,
    handle: CompletionHandle,
}

impl PendingWriteBack {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the copy finishes. There is no timeout.
    pub fn wait(&self) -> Result<()> {
        self.handle.wait().map_err(|e| WriteBackError::scheduler(self.buffer, e))
    }
}

/// Result of a write-back attempt.
#[derive(Debug, Clone)]
pub enum WriteBackOutcome {
    Skipped(SkipReason),
    /// The copy was submitted and has finished.
    Completed,
    /// The copy was submitted and is still in flight.
    Pending(PendingWriteBack),
}

impl WriteBackOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Wait for a pending copy; returns immediately otherwise.
    pub fn wait(&self) -> Result<()> {
        match self {
            Self::Pending(pending) => pending.wait(),
            _ => Ok(()),
        }
    }
}

type SharedRecord = Arc<Mutex<BufferRecord>>;

/// Tracks buffer access histories and drives host write-back at teardown.
pub struct WriteBackEngine<S> {
    scheduler: S,
    config: WriteBackConfig,
    records: RwLock<HashMap<BufferId, SharedRecord>>,
    children: RwLock<HashMap<BufferId, Vec<BufferId>>>,
}

impl<S: ReadBackScheduler> WriteBackEngine<S> {
    /// Create an engine with the default configuration.
    pub fn new(scheduler: S) -> Self {
        Self::with_config(scheduler, WriteBackConfig::default())
    }

    pub fn with_config(scheduler: S, config: WriteBackConfig) -> Self {
        debug!(
            blocking_teardown = config.blocking_teardown,
            history_capacity = config.history_capacity,
            "write-back engine created"
        );
        Self {
            scheduler,
            config,
            records: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn config(&self) -> &WriteBackConfig {
        &self.config
    }

    // ── registration ────────────────────────────────────────────────────

    /// Create an empty-history record for `id`.
    ///
    /// A retired record under the same id is replaced: the id is an address
    /// and may be reused once the previous owner is gone.
    ///
    /// # Panics
    ///
    /// If `id` is registered and still active.
    #[track_caller]
    pub fn register_buffer(&self, id: BufferId, geometry: BufferGeometry) {
        self.insert_record(BufferRecord::new(id, geometry, self.config.history_capacity));
        debug!(
            buffer = %id,
            size = geometry.size_bytes,
            offset = geometry.offset_bytes,
            sub_buffer = geometry.is_sub_buffer,
            "buffer registered"
        );
    }

    /// Register a sub-buffer of `parent` covering `size_bytes` at
    /// `offset_bytes`.
    ///
    /// The sub-buffer gets its own history; accesses through the parent are
    /// not seen by it and vice versa.
    ///
    /// Offsets are relative to the root allocation, so `parent` must be a
    /// whole buffer.
    ///
    /// # Panics
    ///
    /// If `parent` is unregistered, retired or itself a sub-buffer, the
    /// range exceeds the parent, or `child` is registered and still active.
    #[track_caller]
    pub fn register_sub_buffer(&self, parent: BufferId, child: BufferId, size_bytes: usize, offset_bytes: usize) {
        let parent_record = self.snapshot(parent);
        assert!(!parent_record.is_retired(), "sub-buffer {child} registered on retired parent {parent}");
        let parent_geometry = parent_record.geometry();
        assert!(
            !parent_geometry.is_sub_buffer,
            "sub-buffer {child} registered on sub-buffer {parent}; register it on the root buffer"
        );
        let geometry = BufferGeometry::sub_buffer(size_bytes, offset_bytes);
        assert!(
            geometry.end() <= parent_geometry.end(),
            "sub-buffer {child} range {offset_bytes}..{} exceeds parent {parent} of {} bytes",
            geometry.end(),
            parent_geometry.size_bytes
        );
        self.insert_record(
            BufferRecord::new(child, geometry, self.config.history_capacity).with_parent(parent),
        );
        let mut children = write(&self.children);
        let siblings = children.entry(parent).or_default();
        if !siblings.contains(&child) {
            siblings.push(child);
        }
        debug!(%parent, buffer = %child, size = size_bytes, offset = offset_bytes, "sub-buffer registered");
    }

    #[track_caller]
    fn insert_record(&self, record: BufferRecord) {
        let id = record.id();
        let mut records = write(&self.records);
        if let Some(existing) = records.get(&id) {
            let previous = lock(existing).clone();
            assert!(previous.is_retired(), "buffer {id} registered twice");
            trace!(buffer = %id, "replacing retired record");
            self.unlink(&previous);
        }
        records.insert(id, Arc::new(Mutex::new(record)));
    }

    /// Remove `record` from the parent/child links.
    fn unlink(&self, record: &BufferRecord) {
        let mut children = write(&self.children);
        children.remove(&record.id());
        if let Some(siblings) = record.parent().and_then(|parent| children.get_mut(&parent)) {
            siblings.retain(|c| *c != record.id());
        }
    }

    /// Drop a retired record. Returns the record as it was at teardown.
    ///
    /// # Panics
    ///
    /// If `id` is unregistered or still active.
    #[track_caller]
    pub fn forget(&self, id: BufferId) -> BufferRecord {
        let mut records = write(&self.records);
        let Some(shared) = records.get(&id) else {
            panic!("no record of buffer {id}");
        };
        let record = lock(shared).clone();
        assert!(record.is_retired(), "cannot forget active buffer {id}");
        records.remove(&id);
        drop(records);

        self.unlink(&record);
        trace!(buffer = %id, "record forgotten");
        record
    }

    // ── policy and history ──────────────────────────────────────────────

    /// Force write-back on or off for `id`. Last call wins.
    ///
    /// # Panics
    ///
    /// If `id` is unregistered.
    #[track_caller]
    pub fn set_write_back(&self, id: BufferId, enabled: bool) {
        let policy = WriteBackPolicy::from_flag(enabled);
        let shared = self.record(id);
        let mut record = lock(&shared);
        if record.policy().is_set() && record.policy() != policy {
            debug!(buffer = %id, from = %record.policy(), to = %policy, "write-back policy overridden");
        }
        record.set_policy(policy);
        debug!(buffer = %id, %policy, "write-back policy set");
    }

    /// Append an access event to the front of `id`'s history.
    ///
    /// # Panics
    ///
    /// If `id` is unregistered or retired.
    #[track_caller]
    pub fn record_access(
        &self,
        id: BufferId,
        mode: AccessMode,
        origin: AccessOrigin,
        context: Option<ExecutionContext>,
    ) {
        let shared = self.record(id);
        lock(&shared).record(AccessEvent { origin, mode, context });
        trace!(buffer = %id, %mode, ?origin, ?context, "access recorded");
    }

    /// Record a host accessor.
    #[track_caller]
    pub fn record_host_access(&self, id: BufferId, mode: AccessMode) {
        self.record_access(id, mode, AccessOrigin::Host, None);
    }

    /// Record an accessor used by device work in `context`.
    #[track_caller]
    pub fn record_device_access(&self, id: BufferId, mode: AccessMode, context: ExecutionContext) {
        self.record_access(id, mode, AccessOrigin::Device, Some(context));
    }

    // ── decisions ───────────────────────────────────────────────────────

    /// Whether `id`'s host memory is behind the newest device write.
    #[track_caller]
    pub fn needs_write_back(&self, id: BufferId) -> bool {
        let shared = self.record(id);
        let needed = lock(&shared).needs_write_back();
        if self.config.log_decisions {
            debug!(buffer = %id, needed, "write-back decision");
        }
        needed
    }

    /// The context holding the data to copy back, or `None` when
    /// [`needs_write_back`](Self::needs_write_back) is false.
    #[track_caller]
    pub fn context_for_write_back(&self, id: BufferId) -> Option<ExecutionContext> {
        lock(&self.record(id)).context_for_write_back()
    }

    /// When `id`'s host memory gets refreshed, ignoring the override.
    #[track_caller]
    pub fn timing(&self, id: BufferId) -> WriteBackTiming {
        lock(&self.record(id)).timing()
    }

    /// Whether a copy back happens at `trigger`, honouring the override.
    #[track_caller]
    pub fn should_write_back(&self, id: BufferId, trigger: WriteBackTrigger) -> bool {
        let shared = self.record(id);
        let record = lock(&shared);
        timing::should_write_back(record.policy(), record.timing(), trigger)
    }

    // ── write-back ──────────────────────────────────────────────────────

    /// Copy the newest device data for `id` into `destination` if needed.
    ///
    /// With `blocking` the call returns once the copy finished; otherwise it
    /// returns [`WriteBackOutcome::Pending`] right after submission.
    /// A retired record is skipped with [`SkipReason::Retired`].
    ///
    /// # Errors
    ///
    /// Scheduler failures to submit or complete the copy. They are not
    /// retried.
    #[track_caller]
    pub fn perform_write_back(&self, id: BufferId, destination: HostPtr, blocking: bool) -> Result<WriteBackOutcome> {
        let shared = self.record(id);
        let plan = {
            let record = lock(&shared);
            if record.is_retired() { Err(SkipReason::Retired) } else { self.plan(&record, destination) }
        };
        match plan {
            Err(reason) => Ok(self.skipped(id, reason)),
            Ok(request) => self.submit(request, blocking),
        }
    }

    /// Teardown hook: retire `id` and perform its write-back.
    ///
    /// The record stops accepting events in the same critical section that
    /// takes the decision.
    ///
    /// # Panics
    ///
    /// If `id` is unregistered or already retired.
    #[track_caller]
    pub fn retire(&self, id: BufferId, destination: HostPtr, blocking: bool) -> Result<WriteBackOutcome> {
        let shared = self.record(id);
        let plan = {
            let mut record = lock(&shared);
            record.retire();
            self.plan(&record, destination)
        };
        debug!(buffer = %id, "buffer retired");
        match plan {
            Err(reason) => Ok(self.skipped(id, reason)),
            Ok(request) => self.submit(request, blocking),
        }
    }

    /// [`retire`](Self::retire) using the configured `blocking_teardown`.
    #[track_caller]
    pub fn retire_default(&self, id: BufferId, destination: HostPtr) -> Result<WriteBackOutcome> {
        self.retire(id, destination, self.config.blocking_teardown)
    }

    #[track_caller]
    fn plan(&self, record: &BufferRecord, destination: HostPtr) -> std::result::Result<ReadBackRequest, SkipReason> {
        if record.policy().is_forced_off() {
            return Err(SkipReason::ForcedOff);
        }
        if !record.needs_write_back() {
            return Err(SkipReason::HostCurrent);
        }
        if destination.is_null() {
            return Err(SkipReason::NullDestination);
        }
        let Some(source) = record.context_for_write_back() else {
            panic!("buffer {} needs write-back but its newest device write has no context", record.id());
        };
        let geometry = record.geometry();
        Ok(ReadBackRequest {
            buffer: record.id(),
            range: ByteRange { offset: geometry.offset_bytes, size: geometry.size_bytes },
            source,
            destination,
        })
    }

    fn skipped(&self, id: BufferId, reason: SkipReason) -> WriteBackOutcome {
        if self.config.log_decisions {
            debug!(buffer = %id, ?reason, "write-back skipped");
        }
        WriteBackOutcome::Skipped(reason)
    }

    fn submit(&self, request: ReadBackRequest, blocking: bool) -> Result<WriteBackOutcome> {
        let id = request.buffer;
        let handle = self
            .scheduler
            .submit_read_back(request)
            .map_err(|e| self.failed(id, e))?;
        info!(
            buffer = %id,
            source = %request.source,
            offset = request.range.offset,
            size = request.range.size,
            request_id = handle.id(),
            blocking,
            "write-back submitted"
        );
        if !blocking {
            return Ok(WriteBackOutcome::Pending(PendingWriteBack { buffer: id, handle }));
        }
        self.scheduler.wait(&handle).map_err(|e| self.failed(id, e))?;
        debug!(buffer = %id, request_id = handle.id(), "write-back completed");
        Ok(WriteBackOutcome::Completed)
    }

    fn failed(&self, id: BufferId, source: SchedulerError) -> WriteBackError {
        warn!(buffer = %id, error = %source, "write-back failed");
        WriteBackError::scheduler(id, source)
    }

    // ── introspection ───────────────────────────────────────────────────

    #[track_caller]
    fn record(&self, id: BufferId) -> SharedRecord {
        match read(&self.records).get(&id) {
            Some(shared) => Arc::clone(shared),
            None => panic!("no record of buffer {id}"),
        }
    }

    pub fn is_registered(&self, id: BufferId) -> bool {
        read(&self.records).contains_key(&id)
    }

    /// Number of records, active and retired.
    pub fn len(&self) -> usize {
        read(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.records).is_empty()
    }

    #[track_caller]
    pub fn geometry(&self, id: BufferId) -> BufferGeometry {
        lock(&self.record(id)).geometry()
    }

    #[track_caller]
    pub fn policy(&self, id: BufferId) -> WriteBackPolicy {
        lock(&self.record(id)).policy()
    }

    #[track_caller]
    pub fn state(&self, id: BufferId) -> RecordState {
        lock(&self.record(id)).state()
    }

    /// Snapshot of `id`'s history, newest first.
    #[track_caller]
    pub fn history(&self, id: BufferId) -> Vec<AccessEvent> {
        lock(&self.record(id)).history().to_vec()
    }

    /// Copy of `id`'s full record.
    #[track_caller]
    pub fn snapshot(&self, id: BufferId) -> BufferRecord {
        lock(&self.record(id)).clone()
    }

    /// Sub-buffers registered against `parent`, in registration order.
    pub fn sub_buffers(&self, parent: BufferId) -> Vec<BufferId> {
        read(&self.children).get(&parent).cloned().unwrap_or_default()
    }

    pub fn has_sub_buffers(&self, parent: BufferId) -> bool {
        read(&self.children).get(&parent).is_some_and(|c| !c.is_empty())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
