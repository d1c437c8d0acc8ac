//! Chunk grids and next-chunk selection.
//!
//! A partial file carries one [`ChunkGrid`] per chunk size it knows,
//! typically one per hashset algorithm family. Within a grid the chunks
//! tile `[0, size)` contiguously without overlap; grids of different
//! sizes overlap each other freely on the byte axis.
//!
//! Selection of the next chunk to download is strictly deterministic:
//! incomplete chunks are ordered by the composite key
//! `(has availability desc, use count asc, partial desc, availability
//! asc, position asc)`, which prefers completing partially-downloaded
//! chunks and picks the rarest chunk among equals.

use std::collections::BTreeMap;

use crate::hash::HashValue;
use crate::range::{Range64, RangeList64};

/// A chunk is ineligible for further reservations once this many
/// concurrent users hold it.
pub const CHUNK_USE_LIMIT: u32 = 3;

/// Most chunks a single reservation may span.
pub const MAX_RESERVE_CHUNKS: usize = 4;

/// One hash-verifiable segment of the file.
#[derive(Debug, Clone)]
pub struct Chunk {
    begin: u64,
    end: u64,
    /// Grid unit; the real length is smaller for the last chunk.
    ideal_size: u64,
    /// Reference hash, when the defining hashset carried one.
    hash: Option<HashValue>,
    pub(crate) verified: bool,
    pub(crate) partial: bool,
    pub(crate) complete: bool,
    /// Sum of source counts reporting they carry this chunk.
    pub(crate) avail: u32,
    /// Concurrent reservations overlapping this chunk.
    pub(crate) use_count: u32,
}

impl Chunk {
    pub fn range(&self) -> Range64 {
        Range64::new(self.begin, self.end)
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn length(&self) -> u64 {
        self.end - self.begin + 1
    }

    pub fn ideal_size(&self) -> u64 {
        self.ideal_size
    }

    pub fn hash(&self) -> Option<&HashValue> {
        self.hash.as_ref()
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn availability(&self) -> u32 {
        self.avail
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Selector sort key; lower orders first.
    fn select_key(&self, index: usize) -> (bool, u32, bool, u32, usize) {
        (!self.has_avail(), self.use_count, !self.partial, self.avail, index)
    }

    fn has_avail(&self) -> bool {
        self.avail > 0
    }
}

// ── ChunkGrid ────────────────────────────────────────────────────

/// Contiguous tiling of the file at one chunk size.
#[derive(Debug, Clone)]
pub struct ChunkGrid {
    chunk_size: u64,
    chunks: Vec<Chunk>,
}

impl ChunkGrid {
    /// Tile `[0, size)` at `chunk_size`, attaching reference hashes
    /// where supplied.
    pub fn new(size: u64, chunk_size: u64, hashes: &[HashValue]) -> Self {
        debug_assert!(size > 0 && chunk_size > 0);
        let count = size.div_ceil(chunk_size) as usize;
        let mut chunks = Vec::with_capacity(count);
        for i in 0..count {
            let begin = i as u64 * chunk_size;
            let end = (begin + chunk_size - 1).min(size - 1);
            chunks.push(Chunk {
                begin,
                end,
                ideal_size: chunk_size,
                hash: hashes.get(i).copied(),
                verified: false,
                partial: false,
                complete: false,
                avail: 0,
                use_count: 0,
            });
        }
        Self { chunk_size, chunks }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    /// Chunk covering a byte offset.
    pub fn index_of(&self, offset: u64) -> usize {
        ((offset / self.chunk_size) as usize).min(self.chunks.len().saturating_sub(1))
    }

    pub fn is_fully_verified(&self) -> bool {
        self.chunks.iter().all(|c| c.verified)
    }

    /// Attach reference hashes after the fact (hashset learned late).
    /// Existing hashes are never replaced.
    pub fn attach_hashes(&mut self, hashes: &[HashValue]) {
        for (chunk, hash) in self.chunks.iter_mut().zip(hashes) {
            if chunk.hash.is_none() {
                chunk.hash = Some(*hash);
                // A hash arriving for an auto-verified chunk demotes it
                // back to written-but-unverified.
                if chunk.verified {
                    chunk.verified = false;
                }
            }
        }
    }

    /// Pick the next chunk per the composite selector. `mask`, when
    /// given, restricts eligibility to chunks the peer reports having.
    pub fn select(&self, mask: Option<&[bool]>, excluded: &RangeList64) -> Option<usize> {
        self.eligible(mask, excluded)
            .min_by_key(|&i| self.chunks[i].select_key(i))
    }

    /// Extend a reservation from `start` over following chunks that
    /// are incomplete, unused and peer-available, bounded by
    /// [`MAX_RESERVE_CHUNKS`].
    pub fn reserve_span(
        &self,
        start: usize,
        mask: Option<&[bool]>,
        excluded: &RangeList64,
    ) -> Range64 {
        let mut last = start;
        while last + 1 < self.chunks.len() && last - start + 1 < MAX_RESERVE_CHUNKS {
            let next = &self.chunks[last + 1];
            if next.complete
                || next.use_count > 0
                || !mask.is_none_or(|m| m.get(last + 1).copied().unwrap_or(false))
                || excluded.contains_full(&next.range())
            {
                break;
            }
            last += 1;
        }
        Range64::new(self.chunks[start].begin, self.chunks[last].end)
    }

    fn eligible<'a>(
        &'a self,
        mask: Option<&'a [bool]>,
        excluded: &'a RangeList64,
    ) -> impl Iterator<Item = usize> + 'a {
        self.chunks.iter().enumerate().filter_map(move |(i, c)| {
            if c.complete || c.use_count >= CHUNK_USE_LIMIT {
                return None;
            }
            if !mask.is_none_or(|m| m.get(i).copied().unwrap_or(false)) {
                return None;
            }
            if excluded.contains_full(&c.range()) {
                return None;
            }
            Some(i)
        })
    }

    /// Refresh `complete`/`partial` flags from the written-byte set.
    /// Chunks that lost bytes lose their verified flag. When
    /// `auto_verify` is set (the file has no reference hashes at all,
    /// so there is nothing to check against), completed chunks verify
    /// trivially.
    pub fn update_written(&mut self, written: &RangeList64, auto_verify: bool) {
        for c in self.chunks.iter_mut() {
            let range = Range64::new(c.begin, c.end);
            let full = written.contains_full(&range);
            c.partial = !full && written.contains(&range);
            c.complete = full;
            if !full {
                c.verified = false;
            } else if c.hash.is_none() && auto_verify {
                c.verified = true;
            }
        }
    }

    /// True when any chunk carries a reference hash.
    pub fn has_reference_hashes(&self) -> bool {
        self.chunks.iter().any(|c| c.hash.is_some())
    }

    /// Mark every chunk fully inside `range` verified and complete.
    pub fn mark_verified(&mut self, range: &Range64) {
        for c in self.chunks.iter_mut() {
            if range.contains_full(&Range64::new(c.begin, c.end)) {
                c.verified = true;
                c.complete = true;
                c.partial = false;
            }
        }
    }

    /// Re-open every chunk fully inside `range` for download.
    pub fn mark_corrupt(&mut self, range: &Range64) {
        for c in self.chunks.iter_mut() {
            if range.contains_full(&Range64::new(c.begin, c.end)) {
                c.verified = false;
                c.partial = false;
                c.complete = false;
            }
        }
    }

    /// Adjust use counts for chunks overlapping a reservation.
    pub fn adjust_use(&mut self, range: &Range64, delta: i32) {
        for c in self.chunks.iter_mut() {
            if range.contains(&Range64::new(c.begin, c.end)) {
                c.use_count = c.use_count.saturating_add_signed(delta);
            }
        }
    }

    /// Apply an availability delta from a source's chunk mask.
    pub fn adjust_avail_mask(&mut self, mask: &[bool], delta: i32) {
        for (c, &has) in self.chunks.iter_mut().zip(mask) {
            if has {
                c.avail = c.avail.saturating_add_signed(delta);
            }
        }
    }

    /// Apply an availability delta from a source that has everything.
    pub fn adjust_avail_all(&mut self, delta: i32) {
        for c in self.chunks.iter_mut() {
            c.avail = c.avail.saturating_add_signed(delta);
        }
    }
}

// ── ChunkMap ─────────────────────────────────────────────────────

/// The grids of one partial file, keyed by chunk size.
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    grids: BTreeMap<u64, ChunkGrid>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a grid for a chunk size; a no-op when one already exists
    /// (grids are never re-tiled).
    pub fn add_grid(&mut self, size: u64, chunk_size: u64, hashes: &[HashValue]) {
        match self.grids.get_mut(&chunk_size) {
            Some(grid) => grid.attach_hashes(hashes),
            None => {
                self.grids.insert(chunk_size, ChunkGrid::new(size, chunk_size, hashes));
            }
        }
    }

    pub fn grid(&self, chunk_size: u64) -> Option<&ChunkGrid> {
        self.grids.get(&chunk_size)
    }

    pub fn grid_mut(&mut self, chunk_size: u64) -> Option<&mut ChunkGrid> {
        self.grids.get_mut(&chunk_size)
    }

    pub fn grids(&self) -> impl Iterator<Item = &ChunkGrid> {
        self.grids.values()
    }

    pub fn grids_mut(&mut self) -> impl Iterator<Item = &mut ChunkGrid> {
        self.grids.values_mut()
    }

    pub fn grid_count(&self) -> usize {
        self.grids.len()
    }

    pub fn update_written(&mut self, written: &RangeList64) {
        let auto_verify = !self.grids.values().any(ChunkGrid::has_reference_hashes);
        for grid in self.grids.values_mut() {
            grid.update_written(written, auto_verify);
        }
    }

    pub fn mark_verified(&mut self, range: &Range64) {
        for grid in self.grids.values_mut() {
            grid.mark_verified(range);
        }
    }

    pub fn mark_corrupt(&mut self, range: &Range64) {
        for grid in self.grids.values_mut() {
            grid.mark_corrupt(range);
        }
    }

    /// True when at least one grid is fully verified.
    pub fn any_grid_verified(&self) -> bool {
        self.grids.values().any(ChunkGrid::is_fully_verified)
    }
}
