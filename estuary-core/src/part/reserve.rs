//! Range reservations: coarse per-peer regions and fine write locks.
//!
//! A [`UsedRange`] is a multi-chunk region handed to one peer session;
//! overlapping reservations from different peers are allowed. A
//! [`LockedRange`] carves exclusive write authority for a sub-region
//! out of its parent reservation: within one reservation locks never
//! overlap, across reservations they may (multi-sourcing the same
//! bytes).
//!
//! Ownership points strictly upward: a lock holds its reservation
//! alive, a reservation holds the partial file alive. Dropping a lock
//! returns its unwritten bytes to the pool; dropping a reservation
//! releases the chunk use counts it was responsible for. A reservation
//! outliving a `stop()` goes inert instead of corrupting state: the
//! partial file tracks a generation counter and ignores stale handles.

use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::range::{Range64, RangeList64};

use super::PartData;

/// A coarse region reserved for one peer session.
pub struct UsedRange {
    parent: Arc<PartData>,
    range: Range64,
    chunk_size: u64,
    generation: u64,
    /// Locks currently carved out of this reservation.
    locked: Mutex<RangeList64>,
}

impl UsedRange {
    pub(crate) fn new(
        parent: Arc<PartData>,
        range: Range64,
        chunk_size: u64,
        generation: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            range,
            chunk_size,
            generation,
            locked: Mutex::new(RangeList64::new()),
        })
    }

    pub fn range(&self) -> Range64 {
        self.range
    }

    pub fn begin(&self) -> u64 {
        self.range.begin()
    }

    pub fn end(&self) -> u64 {
        self.range.end()
    }

    pub fn length(&self) -> u64 {
        self.range.length()
    }

    /// Chunk size of the grid this reservation was selected from.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn part(&self) -> &Arc<PartData> {
        &self.parent
    }

    /// Carve out up to `max_bytes` of contiguous, not-yet-locked,
    /// not-yet-written bytes. Returns None when none remain.
    pub fn get_lock(self: &Arc<Self>, max_bytes: u64) -> Option<LockedRange> {
        if max_bytes == 0 {
            return None;
        }
        // Bytes already written (or excluded) are blocked for every
        // reservation; bytes locked are blocked only within this one.
        let mut blocked = self.parent.blocked_within(self.range, self.generation)?;
        {
            let locked = self.locked.lock().expect("used range lock");
            for r in locked.iter() {
                blocked.merge(*r);
            }
        }

        let free = first_free_in(&blocked, self.range, max_bytes)?;
        self.locked.lock().expect("used range lock").merge(free);
        Some(LockedRange {
            used: Arc::clone(self),
            range: free,
            written: Mutex::new(RangeList64::new()),
        })
    }
}

impl Drop for UsedRange {
    fn drop(&mut self) {
        self.parent.release_used(self.chunk_size, self.range, self.generation);
    }
}

impl std::fmt::Debug for UsedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsedRange")
            .field("range", &self.range)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// First gap of `blocked` inside `within`, capped at `limit` bytes.
fn first_free_in(blocked: &RangeList64, within: Range64, limit: u64) -> Option<Range64> {
    let mut cursor = within.begin();
    loop {
        match blocked.iter().find(|b| b.contains_point(cursor)) {
            Some(b) => {
                if b.end() >= within.end() {
                    return None;
                }
                cursor = b.end() + 1;
            }
            None => {
                let mut end = blocked
                    .iter()
                    .filter(|b| b.begin() > cursor)
                    .map(|b| b.begin() - 1)
                    .min()
                    .unwrap_or(within.end())
                    .min(within.end());
                if end - cursor + 1 > limit {
                    end = cursor + limit - 1;
                }
                return Some(Range64::new(cursor, end));
            }
        }
    }
}

// ── LockedRange ──────────────────────────────────────────────────

/// Exclusive write authority over a sub-region of a reservation. The
/// only legal handle through which bytes enter a partial file.
pub struct LockedRange {
    used: Arc<UsedRange>,
    range: Range64,
    written: Mutex<RangeList64>,
}

impl LockedRange {
    pub fn range(&self) -> Range64 {
        self.range
    }

    pub fn begin(&self) -> u64 {
        self.range.begin()
    }

    pub fn end(&self) -> u64 {
        self.range.end()
    }

    pub fn length(&self) -> u64 {
        self.range.length()
    }

    pub fn part(&self) -> &Arc<PartData> {
        self.used.part()
    }

    /// Write received bytes at `offset`. The written region must lie
    /// within the lock.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64 - 1;
        let region = Range64::new(offset, end);
        if !self.range.contains_full(&region) {
            return Err(CoreError::range_conflict("write outside lock"));
        }
        self.used.parent.write_locked(self.used.generation, region, data)?;
        self.written.lock().expect("locked range lock").merge(region);
        Ok(())
    }

    /// True once every byte of the lock has been written.
    pub fn is_complete(&self) -> bool {
        self.written
            .lock()
            .expect("locked range lock")
            .contains_full(&self.range)
    }

    /// Bytes written through this lock so far.
    pub fn written_length(&self) -> u64 {
        self.written.lock().expect("locked range lock").total_length()
    }
}

impl Drop for LockedRange {
    fn drop(&mut self) {
        // Unwritten bytes become free again for the parent
        // reservation.
        self.used.locked.lock().expect("used range lock").erase(&self.range);
    }
}

impl std::fmt::Debug for LockedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRange").field("range", &self.range).finish()
    }
}
