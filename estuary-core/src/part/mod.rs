//! Partial-file storage and state.
//!
//! [`PartData`] is the authoritative owner of a download in progress:
//! the sparse on-disk file, the chunk grids with their verified /
//! partial flags, the write buffer, and the reservation bookkeeping.
//! Peers obtain a [`UsedRange`] through [`PartData::get_range`], carve
//! [`LockedRange`]s out of it and write received bytes through those
//! locks; hash-verified chunks become permanently available and failed
//! ones are rolled back by [`PartData::corruption`].
//!
//! Disk failures are fatal for the one file (it stops); hash mismatches
//! are not errors at all, only more downloading.

mod chunks;
mod reserve;

pub use chunks::{Chunk, ChunkGrid, ChunkMap, CHUNK_USE_LIMIT, MAX_RESERVE_CHUNKS};
pub use reserve::{LockedRange, UsedRange};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::events::{CoreEvent, EventQueue, PartEvent};
use crate::hash::{HashAlgo, HashValue};
use crate::hasher::{HashOutcome, HashWork};
use crate::hashset::{HashSet, ED2K_PART_SIZE};
use crate::metadata::MetaData;
use crate::range::{Range64, RangeList64};
use crate::wire::{Reader, Writer};
use crate::work::WorkQueue;

/// Sidecar stream version.
const DAT_VERSION: u8 = 0xE0;

/// Write buffer cap; beyond this a flush is forced.
const BUFFER_CAP: usize = 256 * 1024;

bitflags! {
    /// Per-chunk flags in the sidecar.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ChunkFlags: u8 {
        const VERIFIED = 1 << 0;
        const PARTIAL = 1 << 1;
    }
}

/// Process-unique id of a partial file; events refer to parts by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId(u64);

impl PartId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part#{}", self.0)
    }
}

/// Download lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Running,
    Paused,
    Stopped,
    /// All data verified; waiting for the move to the destination.
    Moving,
    Complete,
    Canceled,
}

// ── PartData ─────────────────────────────────────────────────────

struct PartInner {
    dest: PathBuf,
    work_path: PathBuf,
    size: u64,
    state: PartState,
    /// Bumped by stop()/cancel(); stale reservations go inert.
    generation: u64,
    chunks: ChunkMap,
    /// Written (not necessarily verified) bytes.
    written: RangeList64,
    /// Regions the user excluded from downloading.
    dont_download: RangeList64,
    /// Buffered writes not yet on disk, keyed by offset.
    buffer: BTreeMap<u64, Vec<u8>>,
    buffered: usize,
    /// Outstanding hash jobs, for invalidation.
    pending: Vec<Arc<HashWork>>,
    file: Option<File>,
}

/// A partially downloaded file.
pub struct PartData {
    id: PartId,
    events: EventQueue,
    work: WorkQueue,
    inner: Mutex<PartInner>,
}

impl PartData {
    /// Create a fresh download: allocate the sparse working file next
    /// to `dest` and set up chunk grids from the metadata hashsets (a
    /// single hashless grid when nothing is known yet).
    pub fn create(
        dest: impl Into<PathBuf>,
        size: u64,
        meta: Option<&MetaData>,
        events: EventQueue,
        work: WorkQueue,
    ) -> Result<Arc<Self>, CoreError> {
        let dest = dest.into();
        if size == 0 {
            return Err(CoreError::Stream("zero-size download"));
        }
        let work_path = work_path_for(&dest)?;

        if let Some(parent) = work_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&work_path)?;
        file.set_len(size)?;

        let mut chunks = ChunkMap::new();
        if let Some(meta) = meta {
            for hs in meta.hash_sets().iter().filter(|hs| hs.has_chunks()) {
                chunks.add_grid(size, hs.chunk_size(), hs.chunk_hashes());
            }
        }
        if chunks.grid_count() == 0 {
            chunks.add_grid(size, size.min(ED2K_PART_SIZE), &[]);
        }

        info!(target: "estuary::part", dest = %dest.display(), size, "download created");
        Ok(Arc::new(Self {
            id: PartId::next(),
            events,
            work,
            inner: Mutex::new(PartInner {
                dest,
                work_path,
                size,
                state: PartState::Running,
                generation: 0,
                chunks,
                written: RangeList64::new(),
                dont_download: RangeList64::new(),
                buffer: BTreeMap::new(),
                buffered: 0,
                pending: Vec::new(),
                file: None,
            }),
        }))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn id(&self) -> PartId {
        self.id
    }

    pub fn dest(&self) -> PathBuf {
        self.lock().dest.clone()
    }

    pub fn work_path(&self) -> PathBuf {
        self.lock().work_path.clone()
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn state(&self) -> PartState {
        self.lock().state
    }

    /// Completed byte count: every written byte not rolled back.
    pub fn completed(&self) -> u64 {
        self.lock().written.total_length()
    }

    /// True when at least one chunk grid is fully verified.
    pub fn is_complete(&self) -> bool {
        self.lock().chunks.any_grid_verified()
    }

    /// Snapshot of a grid's chunks (diagnostics, source masks).
    pub fn grid_chunks(&self, chunk_size: u64) -> Option<Vec<Chunk>> {
        self.lock().chunks.grid(chunk_size).map(|g| g.chunks().to_vec())
    }

    pub fn grid_count(&self) -> usize {
        self.lock().chunks.grid_count()
    }

    // ── Reservation ──────────────────────────────────────────────

    /// Select a region for a peer to download. The chosen chunk is the
    /// least-used, preferring partially-complete, rarest one the mask
    /// allows; adjacent free chunks are folded in to amortize request
    /// overhead.
    pub fn get_range(
        self: &Arc<Self>,
        chunk_size: u64,
        mask: Option<&[bool]>,
    ) -> Result<Arc<UsedRange>, CoreError> {
        let mut inner = self.lock();
        if inner.state != PartState::Running {
            return Err(CoreError::NoNeededParts);
        }
        let size = inner.size;
        if inner.chunks.grid(chunk_size).is_none() {
            // A protocol may ask at a granularity we have no hashset
            // for yet; tile an unhashed grid for it.
            inner.chunks.add_grid(size, chunk_size, &[]);
            let written = inner.written.clone();
            inner.chunks.update_written(&written);
        }

        let dont = inner.dont_download.clone();
        let grid = inner.chunks.grid(chunk_size).expect("grid just ensured");
        let Some(idx) = grid.select(mask, &dont) else {
            return Err(CoreError::NoNeededParts);
        };
        let span = grid.reserve_span(idx, mask, &dont);

        let generation = inner.generation;
        inner
            .chunks
            .grid_mut(chunk_size)
            .expect("grid just ensured")
            .adjust_use(&span, 1);
        drop(inner);

        Ok(UsedRange::new(Arc::clone(self), span, chunk_size, generation))
    }

    /// Exclude (or re-include) a region from downloading.
    pub fn set_dont_download(&self, range: Range64, exclude: bool) {
        let mut inner = self.lock();
        if exclude {
            inner.dont_download.merge(range);
        } else {
            inner.dont_download.erase(&range);
        }
    }

    // ── Source availability ──────────────────────────────────────

    /// Count a source reporting per-chunk availability at one grid
    /// granularity.
    pub fn add_source_mask(&self, chunk_size: u64, mask: &[bool]) {
        self.adjust_mask(chunk_size, mask, 1);
    }

    pub fn remove_source_mask(&self, chunk_size: u64, mask: &[bool]) {
        self.adjust_mask(chunk_size, mask, -1);
    }

    /// Count a source that carries the whole file.
    pub fn add_full_source(&self) {
        for grid in self.lock().chunks.grids_mut() {
            grid.adjust_avail_all(1);
        }
    }

    pub fn remove_full_source(&self) {
        for grid in self.lock().chunks.grids_mut() {
            grid.adjust_avail_all(-1);
        }
    }

    fn adjust_mask(&self, chunk_size: u64, mask: &[bool], delta: i32) {
        let mut inner = self.lock();
        let size = inner.size;
        if inner.chunks.grid(chunk_size).is_none() {
            inner.chunks.add_grid(size, chunk_size, &[]);
            let written = inner.written.clone();
            inner.chunks.update_written(&written);
        }
        if let Some(grid) = inner.chunks.grid_mut(chunk_size) {
            grid.adjust_avail_mask(mask, delta);
        }
    }

    /// Register a late-arriving hashset: adds (or hash-attaches) the
    /// matching chunk grid.
    pub fn add_hash_set(&self, hs: &HashSet) {
        if !hs.has_chunks() {
            return;
        }
        let mut inner = self.lock();
        let size = inner.size;
        inner.chunks.add_grid(size, hs.chunk_size(), hs.chunk_hashes());
        let written = inner.written.clone();
        inner.chunks.update_written(&written);
    }

    // ── Writing ──────────────────────────────────────────────────

    pub(crate) fn write_locked(
        &self,
        generation: u64,
        region: Range64,
        data: &[u8],
    ) -> Result<(), CoreError> {
        let mut inner = self.lock();
        // A peer may legitimately still hold a lock across a stop();
        // such writes are refused, not asserted on.
        if generation != inner.generation {
            return Err(CoreError::RangeConflict("write through released lock"));
        }
        if !matches!(inner.state, PartState::Running | PartState::Paused) {
            return Err(CoreError::RangeConflict("write while inactive"));
        }
        if region.end() >= inner.size {
            return Err(CoreError::range_conflict("write past end of file"));
        }

        if let Some(old) = inner.buffer.insert(region.begin(), data.to_vec()) {
            inner.buffered -= old.len();
        }
        inner.buffered += data.len();
        inner.written.merge(region);
        let written = inner.written.clone();
        inner.chunks.update_written(&written);

        self.events.post(CoreEvent::Part {
            part: self.id,
            event: PartEvent::DataAdded { begin: region.begin(), len: region.length() },
        });

        if inner.buffered > BUFFER_CAP {
            self.flush_inner(&mut inner)?;
        }
        self.maybe_complete(&mut inner);
        Ok(())
    }

    /// Flush the write buffer to disk.
    pub fn flush(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        self.flush_inner(&mut inner)
    }

    fn flush_inner(&self, inner: &mut PartInner) -> Result<(), CoreError> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        let result = (|| -> std::io::Result<()> {
            if inner.file.is_none() {
                inner.file = Some(OpenOptions::new().write(true).open(&inner.work_path)?);
            }
            let file = inner.file.as_mut().expect("file just opened");
            for (offset, data) in std::mem::take(&mut inner.buffer) {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&data)?;
            }
            Ok(())
        })();
        inner.buffered = 0;

        if let Err(err) = result {
            // Disk trouble is fatal for this file only.
            warn!(target: "estuary::part", %err, file = %inner.work_path.display(),
                "disk write failed; stopping download");
            self.set_state(inner, PartState::Stopped);
            inner.generation += 1;
            return Err(CoreError::Disk(err));
        }
        Ok(())
    }

    // ── Verification ─────────────────────────────────────────────

    /// Queue an asynchronous hash of `range` against `reference`. On
    /// success every chunk fully inside the range becomes verified; on
    /// mismatch the range is re-opened via [`corruption`].
    ///
    /// [`corruption`]: PartData::corruption
    pub fn verify(
        self: &Arc<Self>,
        range: Range64,
        reference: HashValue,
        save: bool,
    ) -> Result<Arc<HashWork>, CoreError> {
        let mut inner = self.lock();
        if range.end() >= inner.size {
            return Err(CoreError::range_conflict("verify past end of file"));
        }
        if save {
            self.flush_inner(&mut inner)?;
        }
        let job = Arc::new(
            HashWork::range(&inner.work_path, range.begin(), range.end(), reference)
                .for_part(self.id),
        );
        inner.pending.push(Arc::clone(&job));
        self.work.hash(Arc::clone(&job));
        Ok(job)
    }

    /// Route a finished hash job back into this part. Called by the
    /// main loop on `HashDone` events carrying this part's id.
    pub fn on_hash_done(&self, job: &Arc<HashWork>) {
        {
            let mut inner = self.lock();
            inner.pending.retain(|p| !Arc::ptr_eq(p, job));
        }
        if !job.is_valid() {
            return;
        }
        let Some((begin, end)) = job.range_bounds() else { return };
        let range = Range64::new(begin, end);

        match job.outcome() {
            Some(HashOutcome::Verified) => {
                let mut inner = self.lock();
                inner.chunks.mark_verified(&range);
                debug!(target: "estuary::part", part = %self.id, range = ?range,
                    "range verified");
                self.maybe_complete(&mut inner);
            }
            Some(HashOutcome::Failed) => {
                debug!(target: "estuary::part", part = %self.id, range = ?range,
                    "hash mismatch; reopening range");
                self.corruption(range);
            }
            Some(HashOutcome::Fatal(err)) => {
                warn!(target: "estuary::part", part = %self.id, %err,
                    "fatal hash error; stopping download");
                let mut inner = self.lock();
                inner.generation += 1;
                self.set_state(&mut inner, PartState::Stopped);
            }
            Some(HashOutcome::Complete(_)) | None => {}
        }
    }

    /// Re-open a region for download: chunks fully inside lose their
    /// flags, the written set shrinks, buffered bytes in the region
    /// are discarded.
    pub fn corruption(&self, range: Range64) {
        let mut inner = self.lock();
        discard_buffer_region(&mut inner, &range);
        inner.written.erase(&range);
        inner.chunks.mark_corrupt(&range);
        let written = inner.written.clone();
        inner.chunks.update_written(&written);
        drop(inner);

        self.events.post(CoreEvent::Part {
            part: self.id,
            event: PartEvent::Corruption { begin: range.begin(), len: range.length() },
        });
    }

    // ── State transitions ────────────────────────────────────────

    /// Block further reservations; existing locks stay valid.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state == PartState::Running {
            self.set_state(&mut inner, PartState::Paused);
        }
    }

    /// Stop: additionally releases outstanding reservations (they go
    /// inert) and drops queued hash jobs.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if !matches!(inner.state, PartState::Running | PartState::Paused) {
            return;
        }
        for job in inner.pending.drain(..) {
            job.invalidate();
        }
        inner.generation += 1;
        let _ = self.flush_inner(&mut inner);
        self.set_state(&mut inner, PartState::Stopped);
    }

    /// Return from Paused or Stopped to Running.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, PartState::Paused | PartState::Stopped) {
            self.set_state(&mut inner, PartState::Running);
            self.maybe_complete(&mut inner);
        }
    }

    /// Abandon the download and erase the on-disk partial file.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, PartState::Complete | PartState::Canceled) {
            return;
        }
        for job in inner.pending.drain(..) {
            job.invalidate();
        }
        inner.generation += 1;
        inner.buffer.clear();
        inner.buffered = 0;
        inner.file = None;
        let _ = std::fs::remove_file(&inner.work_path);
        let _ = std::fs::remove_file(sidecar_path(&inner.work_path));
        self.set_state(&mut inner, PartState::Canceled);
        info!(target: "estuary::part", part = %self.id, "download canceled");
    }

    fn set_state(&self, inner: &mut PartInner, state: PartState) {
        if inner.state == state {
            return;
        }
        inner.state = state;
        self.events.post(CoreEvent::Part {
            part: self.id,
            event: PartEvent::StateChanged(state),
        });
    }

    /// On full verification, flush and hand the file to the mover.
    fn maybe_complete(&self, inner: &mut PartInner) {
        if inner.state != PartState::Running || !inner.chunks.any_grid_verified() {
            return;
        }
        if self.flush_inner(inner).is_err() {
            return;
        }
        inner.file = None;
        self.set_state(inner, PartState::Moving);
        self.work.move_file(self.id, inner.work_path.clone(), inner.dest.clone());
    }

    /// Route a finished move back into this part.
    pub fn on_move_done(&self, error: Option<&str>) {
        let mut inner = self.lock();
        if inner.state != PartState::Moving {
            return;
        }
        match error {
            None => {
                let _ = std::fs::remove_file(sidecar_path(&inner.work_path));
                self.set_state(&mut inner, PartState::Complete);
                self.events.post(CoreEvent::Part { part: self.id, event: PartEvent::Completed });
                info!(target: "estuary::part", part = %self.id,
                    dest = %inner.dest.display(), "download complete");
            }
            Some(err) => {
                warn!(target: "estuary::part", part = %self.id, err, "move failed");
                self.set_state(&mut inner, PartState::Stopped);
            }
        }
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Read `[begin, end]` from the partial storage. The region must
    /// have been written.
    pub fn read(&self, begin: u64, end: u64) -> Result<Vec<u8>, CoreError> {
        let mut inner = self.lock();
        let region = Range64::new(begin, end);
        if end >= inner.size || !inner.written.contains_full(&region) {
            return Err(CoreError::RangeConflict("read of unwritten range"));
        }
        self.flush_inner(&mut inner)?;

        let mut file = File::open(&inner.work_path)?;
        file.seek(SeekFrom::Start(begin))?;
        let mut out = vec![0u8; (end - begin + 1) as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Flush and write the `.dat` sidecar next to the working file.
    pub fn save(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        self.flush_inner(&mut inner)?;

        let mut w = Writer::new();
        w.u8(DAT_VERSION);
        w.u32(0); // reserved
        w.string(&inner.dest.to_string_lossy());
        w.u64(inner.size);
        w.u64(inner.written.total_length());

        w.u32(inner.chunks.grid_count() as u32);
        for grid in inner.chunks.grids() {
            w.u32(grid.chunk_size() as u32);
            w.u32(grid.len() as u32);
            for chunk in grid.chunks() {
                w.u64(chunk.begin());
                w.u64(chunk.end());
                let mut flags = ChunkFlags::empty();
                if chunk.is_verified() {
                    flags |= ChunkFlags::VERIFIED;
                }
                if chunk.is_partial() {
                    flags |= ChunkFlags::PARTIAL;
                }
                w.u8(flags.bits());
                match chunk.hash() {
                    Some(h) => {
                        w.u8(h.algo() as u8);
                        w.bytes(h.digest());
                    }
                    None => {
                        w.u8(0);
                    }
                }
            }
        }

        std::fs::write(sidecar_path(&inner.work_path), w.as_slice())?;
        Ok(())
    }

    /// Load a download from its sidecar. The sparse working file must
    /// still exist with the recorded size.
    pub fn load(
        dat_path: &Path,
        events: EventQueue,
        work: WorkQueue,
    ) -> Result<Arc<Self>, CoreError> {
        let raw = std::fs::read(dat_path)?;
        let mut r = Reader::new(&raw);

        let ver = r.u8("sidecar version")?;
        if ver != DAT_VERSION {
            return Err(CoreError::UnknownVariant { what: "sidecar version", value: ver as u64 });
        }
        let _reserved = r.u32("sidecar reserved")?;
        let dest = PathBuf::from(r.string("sidecar destination")?);
        let size = r.u64("sidecar size")?;
        let _completed = r.u64("sidecar completed")?;

        let work_path = dat_path.with_extension("");
        let on_disk = std::fs::metadata(&work_path)?;
        if on_disk.len() != size {
            return Err(CoreError::Stream("sidecar size mismatch"));
        }

        let mut chunks = ChunkMap::new();
        let mut written = RangeList64::new();
        let grid_count = r.u32("sidecar grid count")?;
        for _ in 0..grid_count {
            let chunk_size = r.u32("grid chunk size")? as u64;
            let chunk_count = r.u32("grid chunk count")?;
            let mut hashes: Vec<HashValue> = Vec::new();
            let mut verified: Vec<Range64> = Vec::new();
            let mut have_all_hashes = true;
            for _ in 0..chunk_count {
                let begin = r.u64("chunk begin")?;
                let end = r.u64("chunk end")?;
                let flags = ChunkFlags::from_bits_truncate(r.u8("chunk flags")?);
                let algo = r.u8("chunk hash algo")?;
                if algo != 0 {
                    let algo = HashAlgo::from_wire(algo)?;
                    let digest = r.bytes(algo.digest_len(), "chunk hash")?;
                    if have_all_hashes {
                        hashes.push(HashValue::new(algo, digest)?);
                    }
                } else {
                    have_all_hashes = false;
                    hashes.clear();
                }
                if flags.contains(ChunkFlags::VERIFIED) {
                    verified.push(Range64::new(begin, end));
                }
            }
            chunks.add_grid(size, chunk_size, &hashes);
            for range in verified {
                written.merge(range);
                chunks.mark_verified(&range);
            }
        }
        chunks.update_written(&written);
        // Re-assert verified flags clobbered by the rewrite above.
        for range in written.iter() {
            chunks.mark_verified(range);
        }

        debug!(target: "estuary::part", dest = %dest.display(),
            completed = written.total_length(), "download resumed from sidecar");
        Ok(Arc::new(Self {
            id: PartId::next(),
            events,
            work,
            inner: Mutex::new(PartInner {
                dest,
                work_path,
                size,
                state: PartState::Running,
                generation: 0,
                chunks,
                written,
                dont_download: RangeList64::new(),
                buffer: BTreeMap::new(),
                buffered: 0,
                pending: Vec::new(),
                file: None,
            }),
        }))
    }

    // ── Internal plumbing for reservations ───────────────────────

    /// Globally blocked bytes within a reservation window: written
    /// bytes and excluded regions. None when the handle is stale or
    /// the file no longer accepts locks.
    pub(crate) fn blocked_within(&self, within: Range64, generation: u64) -> Option<RangeList64> {
        let inner = self.lock();
        if generation != inner.generation
            || !matches!(inner.state, PartState::Running | PartState::Paused)
        {
            return None;
        }
        let mut blocked = RangeList64::new();
        for r in inner.written.iter().filter(|r| r.contains(&within)) {
            blocked.merge(*r);
        }
        for r in inner.dont_download.iter().filter(|r| r.contains(&within)) {
            blocked.merge(*r);
        }
        Some(blocked)
    }

    pub(crate) fn release_used(&self, chunk_size: u64, range: Range64, generation: u64) {
        let mut inner = self.lock();
        if generation != inner.generation {
            return;
        }
        if let Some(grid) = inner.chunks.grid_mut(chunk_size) {
            grid.adjust_use(&range, -1);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartInner> {
        self.inner.lock().expect("part data lock")
    }
}

impl fmt::Debug for PartData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("PartData")
            .field("id", &self.id)
            .field("dest", &inner.dest)
            .field("size", &inner.size)
            .field("state", &inner.state)
            .finish()
    }
}

/// Working file path: the destination name with `.part` appended, in
/// the destination directory.
fn work_path_for(dest: &Path) -> Result<PathBuf, CoreError> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(CoreError::Stream("destination path without file name"))?;
    Ok(dest.with_file_name(format!("{name}.part")))
}

/// Sidecar path: the working file with `.dat` appended.
fn sidecar_path(work_path: &Path) -> PathBuf {
    let mut os = work_path.as_os_str().to_os_string();
    os.push(".dat");
    PathBuf::from(os)
}

/// Drop buffered bytes overlapping `range`, trimming entries that
/// straddle its edges.
fn discard_buffer_region(inner: &mut PartInner, range: &Range64) {
    use crate::range::EraseOutcome;

    let affected: Vec<u64> = inner
        .buffer
        .iter()
        .filter(|(offset, data)| {
            let er = Range64::new(**offset, **offset + data.len() as u64 - 1);
            er.contains(range) || range.contains(&er)
        })
        .map(|(offset, _)| *offset)
        .collect();

    for offset in affected {
        let data = inner.buffer.remove(&offset).expect("buffer entry");
        inner.buffered -= data.len();
        let er = Range64::new(offset, offset + data.len() as u64 - 1);
        match er.erase(range) {
            EraseOutcome::Removed => {}
            EraseOutcome::Trimmed(keep) => {
                let from = (keep.begin() - offset) as usize;
                let to = (keep.end() - offset) as usize + 1;
                let slice = data[from..to].to_vec();
                inner.buffered += slice.len();
                inner.buffer.insert(keep.begin(), slice);
            }
            EraseOutcome::Split(left, right) => {
                let lslice = data[..(left.end() - offset) as usize + 1].to_vec();
                let rfrom = (right.begin() - offset) as usize;
                let rslice = data[rfrom..].to_vec();
                inner.buffered += lslice.len() + rslice.len();
                inner.buffer.insert(left.begin(), lslice);
                inner.buffer.insert(right.begin(), rslice);
            }
        }
    }
}
