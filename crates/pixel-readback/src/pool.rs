//! Staging resource pool.
//!
//! One entry per [`StagingKey`], each holding a backend staging resource and
//! the host buffer results are delivered in. Entries move through
//! `Idle -> CopyInFlight -> ReadyToMap -> Idle`; a key with no entry is absent.
//!
//! A key never has more than one entry. A read that finds its entry's copy
//! still running (an earlier read timed out) waits on that copy instead of
//! allocating beside it. An entry whose copy is still running when it has to
//! go (LRU eviction) is *retired*: removed from the map but not released until
//! the backend reports the copy complete.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use gpu_interop::{CopyStatus, ReadbackBackend, StagingId};
use readback_core::{ReadbackError, StagingKey};
use tracing::{debug, warn};

/// Lifecycle state of a pooled staging resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Allocated, no copy outstanding.
    Idle,
    /// A copy has been submitted and not yet observed complete.
    CopyInFlight,
    /// The copy completed; the resource may be mapped.
    ReadyToMap,
}

/// Allocation counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Staging resources created over the pool's lifetime.
    pub staging_allocations: u64,
    /// Staging resources released over the pool's lifetime.
    pub staging_releases: u64,
    /// Entries currently in the pool.
    pub live_entries: usize,
    /// Retired resources awaiting copy completion.
    pub retired_entries: usize,
    /// Host buffers allocated because no recycled one was available.
    pub host_allocations: u64,
}

#[derive(Debug)]
pub struct PoolEntry {
    id: StagingId,
    state: EntryState,
    last_used: u64,
    /// Host buffer parked here between reads; `None` while a result is out.
    host: Option<Vec<u8>>,
}

impl PoolEntry {
    pub fn id(&self) -> StagingId {
        self.id
    }

    pub fn state(&self) -> EntryState {
        self.state
    }
}

/// Pool of staging resources keyed by `(width, height, format)`.
#[derive(Debug)]
pub struct StagingPool {
    entries: HashMap<StagingKey, PoolEntry>,
    retired: Vec<StagingId>,
    /// Entries kept alive. Zero keeps one only for the duration of a read.
    capacity: usize,
    clock: u64,
    stats: PoolStats,
}

impl StagingPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            retired: Vec::new(),
            capacity,
            clock: 0,
            stats: PoolStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry(&self, key: &StagingKey) -> Option<&PoolEntry> {
        self.entries.get(key)
    }

    pub fn state(&self, key: &StagingKey) -> Option<EntryState> {
        self.entries.get(key).map(|e| e.state)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_entries: self.entries.len(),
            retired_entries: self.retired.len(),
            ..self.stats
        }
    }

    /// Staging resource for `key`, ready for a new copy.
    ///
    /// Reuses an idle entry and allocates when the key is absent, evicting
    /// least-recently-used keys beyond capacity. An entry whose earlier copy
    /// is still outstanding is waited on for up to `wait`; if that copy is
    /// still pending the read fails with [`ReadbackError::Timeout`] and
    /// nothing is allocated.
    pub fn acquire(
        &mut self,
        key: StagingKey,
        backend: &mut dyn ReadbackBackend,
        wait: Duration,
    ) -> Result<StagingId, ReadbackError> {
        self.clock += 1;
        let now = self.clock;

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.state != EntryState::Idle {
                let start = Instant::now();
                if backend.wait_copy(entry.id, wait)? == CopyStatus::Pending {
                    let waited = start.elapsed();
                    warn!(id = %entry.id, ?key, ?waited, "earlier copy still in flight");
                    return Err(ReadbackError::Timeout { waited });
                }
                debug!(id = %entry.id, ?key, "in-flight staging entry reclaimed");
            }
            entry.state = EntryState::Idle;
            entry.last_used = now;
            return Ok(entry.id);
        }

        while self.entries.len() >= self.capacity.max(1) {
            let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k)
            else {
                break;
            };
            self.evict(lru, backend);
        }

        let id = backend.create_staging(key)?;
        self.stats.staging_allocations += 1;
        self.entries.insert(
            key,
            PoolEntry {
                id,
                state: EntryState::Idle,
                last_used: now,
                host: None,
            },
        );
        debug!(%id, ?key, "staging entry allocated");
        Ok(id)
    }

    fn evict(&mut self, key: StagingKey, backend: &mut dyn ReadbackBackend) {
        let Some(entry) = self.entries.remove(&key) else {
            return;
        };
        let complete = match entry.state {
            EntryState::Idle => true,
            _ => matches!(backend.poll_copy(entry.id), Ok(CopyStatus::Complete)),
        };
        if complete {
            debug!(id = %entry.id, ?key, "staging entry evicted");
            self.release(entry.id, backend);
        } else {
            warn!(
                id = %entry.id,
                ?key,
                "evicting staging entry with a copy in flight; retiring it"
            );
            self.retired.push(entry.id);
        }
    }

    fn release(&mut self, id: StagingId, backend: &mut dyn ReadbackBackend) {
        backend.release_staging(id);
        self.stats.staging_releases += 1;
    }

    fn set_state(&mut self, key: &StagingKey, state: EntryState) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.state = state;
        }
    }

    pub fn mark_in_flight(&mut self, key: &StagingKey) {
        self.set_state(key, EntryState::CopyInFlight);
    }

    pub fn mark_ready(&mut self, key: &StagingKey) {
        self.set_state(key, EntryState::ReadyToMap);
    }

    pub fn mark_idle(&mut self, key: &StagingKey) {
        self.set_state(key, EntryState::Idle);
    }

    /// Host buffer of exactly `len` bytes for a read of `key`.
    ///
    /// Returns the buffer parked in the entry when there is one; otherwise
    /// (first read, or the previous result was never recycled) allocates.
    pub fn take_host_buffer(&mut self, key: &StagingKey, len: usize) -> Vec<u8> {
        if let Some(mut buf) = self.entries.get_mut(key).and_then(|e| e.host.take()) {
            buf.resize(len, 0);
            return buf;
        }
        self.stats.host_allocations += 1;
        vec![0; len]
    }

    /// Park a host buffer with its entry for the next read of `key`.
    ///
    /// Dropped if the entry is gone or already holds one.
    pub fn recycle(&mut self, key: &StagingKey, buf: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.host.is_none() {
                entry.host = Some(buf);
            }
        }
    }

    /// Release retired resources whose copies have completed.
    pub fn collect_retired(&mut self, backend: &mut dyn ReadbackBackend) {
        let retired = std::mem::take(&mut self.retired);
        for id in retired {
            match backend.poll_copy(id) {
                Ok(CopyStatus::Complete) => {
                    debug!(%id, "retired staging released");
                    self.release(id, backend);
                }
                Ok(CopyStatus::Pending) => self.retired.push(id),
                // Lost device: the caller invalidates the pool.
                Err(_) => self.retired.push(id),
            }
        }
    }

    /// Drop every entry and retired resource without waiting for copies.
    ///
    /// Used after device loss: the resources are invalid and nothing will
    /// signal their fences.
    pub fn invalidate(&mut self, backend: &mut dyn ReadbackBackend) {
        let ids: Vec<StagingId> = self
            .entries
            .drain()
            .map(|(_, e)| e.id)
            .chain(self.retired.drain(..))
            .collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), "invalidating staging pool after device loss");
        }
        for id in ids {
            self.release(id, backend);
        }
    }

    /// With zero capacity, release `key`'s entry once its read is done.
    ///
    /// An entry left with a copy in flight (timed-out read) stays so the next
    /// read of `key` waits on it; a read of another key evicts it.
    pub fn release_unretained(&mut self, key: &StagingKey, backend: &mut dyn ReadbackBackend) {
        if self.capacity == 0 && self.state(key) != Some(EntryState::CopyInFlight) {
            self.evict(*key, backend);
        }
    }

    /// Wait up to `timeout` in total for outstanding copies, then release
    /// everything. Copies that never complete are released anyway.
    pub fn teardown(&mut self, backend: &mut dyn ReadbackBackend, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut outstanding = std::mem::take(&mut self.retired);
        let entries: Vec<PoolEntry> = self.entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            if entry.state == EntryState::Idle {
                self.release(entry.id, backend);
            } else {
                outstanding.push(entry.id);
            }
        }

        for id in outstanding {
            if !backend.device_lost() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !matches!(backend.wait_copy(id, remaining), Ok(CopyStatus::Complete)) {
                    warn!(%id, "copy still pending at teardown; releasing anyway");
                }
            }
            self.release(id, backend);
        }
    }
}
