//! Inclusive byte ranges and ordered range lists.
//!
//! [`Range`] is a closed interval `[begin, end]`. [`RangeList`] keeps
//! ranges ordered by begin offset and supports two insertion flavours:
//! `push` keeps ranges as-is (overlaps between distinct ranges allowed,
//! exact duplicates rejected), `merge` compacts overlapping and
//! bordering ranges into one. `erase` removes a region, trimming and
//! splitting existing ranges as needed, so that afterwards
//! `contains(region)` is false.
//!
//! The part engine stores its completed, locked and corrupt regions in
//! these lists; the scheduler keeps its unlimited-address table in one.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::CoreError;
use crate::wire::{op, Reader, Writer};

/// Integer types usable as range offsets.
pub trait RangeBound:
    Copy + Ord + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const MIN: Self;
    const MAX: Self;
    /// Wire width in bytes.
    const WIDTH: usize;

    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
    fn succ(self) -> Self;
    fn pred(self) -> Self;
}

macro_rules! impl_range_bound {
    ($($t:ty),*) => {$(
        impl RangeBound for $t {
            const MIN: Self = <$t>::MIN;
            const MAX: Self = <$t>::MAX;
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn to_u64(self) -> u64 { self as u64 }
            fn from_u64(v: u64) -> Self { v as $t }
            fn succ(self) -> Self { self.saturating_add(1) }
            fn pred(self) -> Self { self.saturating_sub(1) }
        }
    )*};
}
impl_range_bound!(u8, u16, u32, u64);

// ── Range ────────────────────────────────────────────────────────

/// A closed interval `[begin, end]`, ordered by begin then end.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Range<T: RangeBound> {
    begin: T,
    end: T,
}

/// Outcome of erasing one range from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome<T: RangeBound> {
    /// The target was swallowed whole.
    Removed,
    /// The target survived with trimmed bounds.
    Trimmed(Range<T>),
    /// The erased region was interior; the target split in two.
    Split(Range<T>, Range<T>),
}

impl<T: RangeBound> Range<T> {
    /// Construct; bounds are normalized so `begin <= end`.
    pub fn new(begin: T, end: T) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self { begin: end, end: begin }
        }
    }

    /// Single-offset range.
    pub fn point(at: T) -> Self {
        Self { begin: at, end: at }
    }

    pub fn begin(&self) -> T {
        self.begin
    }

    pub fn end(&self) -> T {
        self.end
    }

    pub fn length(&self) -> u64 {
        self.end.to_u64() - self.begin.to_u64() + 1
    }

    /// Partial overlap: any shared offset.
    pub fn contains(&self, other: &Range<T>) -> bool {
        self.contains_point(other.begin)
            || self.contains_point(other.end)
            || other.contains_full(self)
    }

    pub fn contains_point(&self, at: T) -> bool {
        self.begin <= at && at <= self.end
    }

    /// Full containment.
    pub fn contains_full(&self, other: &Range<T>) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Overlapping or directly adjacent.
    pub fn borders(&self, other: &Range<T>) -> bool {
        if self.contains(other) {
            return true;
        }
        other.end.succ() == self.begin || self.end.succ() == other.begin
    }

    /// Expand to the union of both ranges.
    pub fn merge(&mut self, other: &Range<T>) {
        if other.begin < self.begin {
            self.begin = other.begin;
        }
        if other.end > self.end {
            self.end = other.end;
        }
    }

    /// Erase `region` from this range.
    pub fn erase(&self, region: &Range<T>) -> EraseOutcome<T> {
        if region.begin <= self.begin && region.end >= self.end {
            return EraseOutcome::Removed;
        }
        if self.begin >= region.begin {
            return EraseOutcome::Trimmed(Range::new(region.end.succ(), self.end));
        }
        if self.end <= region.end {
            return EraseOutcome::Trimmed(Range::new(self.begin, region.begin.pred()));
        }
        EraseOutcome::Split(
            Range::new(self.begin, region.begin.pred()),
            Range::new(region.end.succ(), self.end),
        )
    }

    // ── Wire form: `u8 OP_RANGE | u16 len | T begin | T end` ─────

    pub fn encode(&self, w: &mut Writer) {
        let mut payload = Writer::new();
        put_bound(&mut payload, self.begin);
        put_bound(&mut payload, self.end);
        w.tag(op::RANGE, payload.as_slice());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let mut payload = r.expect_tag(op::RANGE, "range tag")?;
        if payload.remaining() != T::WIDTH * 2 {
            return Err(CoreError::Stream("range width"));
        }
        let begin = get_bound::<T>(&mut payload)?;
        let end = get_bound::<T>(&mut payload)?;
        Ok(Range::new(begin, end))
    }
}

fn put_bound<T: RangeBound>(w: &mut Writer, v: T) {
    match T::WIDTH {
        1 => {
            w.u8(v.to_u64() as u8);
        }
        2 => {
            w.u16(v.to_u64() as u16);
        }
        4 => {
            w.u32(v.to_u64() as u32);
        }
        _ => {
            w.u64(v.to_u64());
        }
    }
}

fn get_bound<T: RangeBound>(r: &mut Reader<'_>) -> Result<T, CoreError> {
    let raw = match T::WIDTH {
        1 => r.u8("range bound")? as u64,
        2 => r.u16("range bound")? as u64,
        4 => r.u32("range bound")? as u64,
        _ => r.u64("range bound")?,
    };
    Ok(T::from_u64(raw))
}

impl<T: RangeBound> fmt::Debug for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

// ── RangeList ────────────────────────────────────────────────────

/// Ordered container of ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeList<T: RangeBound> {
    ranges: BTreeSet<Range<T>>,
}

impl<T: RangeBound> RangeList<T> {
    pub fn new() -> Self {
        Self { ranges: BTreeSet::new() }
    }

    /// Insert without compacting. Returns false on an exact duplicate.
    pub fn push(&mut self, r: Range<T>) -> bool {
        self.ranges.insert(r)
    }

    /// Remove an exact range. Returns false when absent.
    pub fn remove(&mut self, r: &Range<T>) -> bool {
        self.ranges.remove(r)
    }

    /// Merge a range in, compacting every overlapping or bordering
    /// neighbour into one larger range.
    pub fn merge(&mut self, r: Range<T>) {
        let mut merged = r;
        loop {
            let Some(next) = self
                .overlapping(&merged)
                .next()
                .or_else(|| self.bordering(&merged))
            else {
                break;
            };
            merged.merge(&next);
            self.ranges.remove(&next);
        }
        self.ranges.insert(merged);
    }

    /// Erase a region, trimming and splitting stored ranges so no
    /// stored range overlaps it afterwards.
    pub fn erase(&mut self, region: &Range<T>) {
        loop {
            let Some(hit) = self.overlapping(region).next() else {
                break;
            };
            self.ranges.remove(&hit);
            match hit.erase(region) {
                EraseOutcome::Removed => {}
                EraseOutcome::Trimmed(rest) => {
                    self.ranges.insert(rest);
                }
                EraseOutcome::Split(left, right) => {
                    self.ranges.insert(left);
                    self.ranges.insert(right);
                }
            }
        }
    }

    /// Any stored range sharing at least one offset with `r`.
    pub fn contains(&self, r: &Range<T>) -> bool {
        self.overlapping(r).next().is_some()
    }

    pub fn contains_point(&self, at: T) -> bool {
        self.contains(&Range::point(at))
    }

    /// `r` fully covered by a single stored range.
    pub fn contains_full(&self, r: &Range<T>) -> bool {
        self.overlapping(r).any(|stored| stored.contains_full(r))
    }

    /// First unused region, at most `limit` long. Returns None when
    /// the whole value space is covered.
    pub fn first_free(&self, limit: u64) -> Option<Range<T>> {
        debug_assert!(limit > 0);
        let mut cursor = T::MIN;
        for r in &self.ranges {
            if r.begin > cursor {
                break;
            }
            if r.end == T::MAX {
                return None;
            }
            if r.end.succ() > cursor {
                cursor = r.end.succ();
            }
        }
        let mut end = T::MAX;
        if let Some(next) = self.ranges.iter().find(|r| r.begin > cursor) {
            end = next.begin.pred();
        }
        if end.to_u64() - cursor.to_u64() + 1 > limit {
            end = T::from_u64(cursor.to_u64() + limit - 1);
        }
        Some(Range::new(cursor, end))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<T>> {
        self.ranges.iter()
    }

    pub fn front(&self) -> Option<&Range<T>> {
        self.ranges.first()
    }

    pub fn back(&self) -> Option<&Range<T>> {
        self.ranges.last()
    }

    /// Sum of range lengths. Meaningful on merged (disjoint) lists.
    pub fn total_length(&self) -> u64 {
        self.ranges.iter().map(Range::length).sum()
    }

    /// Bytes of `r` covered by stored ranges. Meaningful on merged
    /// (disjoint) lists.
    pub fn covered_length(&self, r: &Range<T>) -> u64 {
        self.overlapping(r)
            .map(|stored| {
                let begin = stored.begin.max(r.begin);
                let end = stored.end.min(r.end);
                end.to_u64() - begin.to_u64() + 1
            })
            .sum()
    }

    fn overlapping(&self, r: &Range<T>) -> impl Iterator<Item = Range<T>> + '_ {
        // Ranges are ordered by begin; anything starting past r.end
        // cannot overlap. Scan backwards from there.
        let probe = Range::new(r.end, T::MAX);
        let r = *r;
        self.ranges
            .range(..=probe)
            .rev()
            .take_while(move |stored| stored.end >= r.begin)
            .filter(move |stored| stored.contains(&r))
            .copied()
    }

    fn bordering(&self, r: &Range<T>) -> Option<Range<T>> {
        let probe = Range::new(if r.end == T::MAX { r.end } else { r.end.succ() }, T::MAX);
        self.ranges
            .range(..=probe)
            .rev()
            .take_while(|stored| stored.end >= r.begin.pred())
            .find(|stored| stored.borders(r))
            .copied()
    }

    // ── Wire form ────────────────────────────────────────────────
    //
    // `u8 OP_RANGELIST | u16 len | u32 count | <OP_RANGE tags>`

    pub fn encode(&self, w: &mut Writer) {
        let mut payload = Writer::new();
        payload.u32(self.ranges.len() as u32);
        for r in &self.ranges {
            r.encode(&mut payload);
        }
        w.tag(op::RANGE_LIST, payload.as_slice());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let mut payload = r.expect_tag(op::RANGE_LIST, "range list tag")?;
        let count = payload.u32("range count")?;
        let mut list = RangeList::new();
        for _ in 0..count {
            list.push(Range::decode(&mut payload)?);
        }
        Ok(list)
    }
}

impl<T: RangeBound> fmt::Debug for RangeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

// ── Common aliases ───────────────────────────────────────────────

pub type Range32 = Range<u32>;
pub type Range64 = Range<u64>;
pub type RangeList32 = RangeList<u32>;
pub type RangeList64 = RangeList<u64>;
