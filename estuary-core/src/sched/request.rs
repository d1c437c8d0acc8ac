//! Scheduler request traits and handles.
//!
//! Protocol modules never touch sockets directly: they express intent
//! as upload, download or connection requests and are called back with
//! a byte budget (or a connection grant) from the scheduler loop. A
//! request behaves as an explicit state machine resumed once per tick.
//!
//! Each submitted request is paired with a [`ReqHandle`] the owner can
//! use to invalidate it out-of-band (socket death, peer gone);
//! invalidated requests are discarded the next time the loop visits
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Outcome mask of a connection attempt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnResult: u8 {
        /// Request is finished and should leave the list.
        const REMOVE = 1 << 0;
        /// The owner wants a notification callback.
        const NOTIFY = 1 << 1;
        /// A socket was opened; count it against the connection limit.
        const ADDCONN = 1 << 2;
    }
}

/// An upload intent: the scheduler grants `amount` bytes per visit.
pub trait UploadRequest: Send {
    /// Send up to `amount` bytes; returns the bytes actually sent.
    fn do_send(&mut self, amount: u32) -> u32;

    /// Bytes still wanting to be sent; the request is finished at 0.
    fn pending(&self) -> u32;

    /// Called after the request was served this tick.
    fn notify(&mut self) {}
}

/// A download intent.
pub trait DownloadRequest: Send {
    /// Receive up to `amount` bytes; returns the bytes actually read.
    /// Returning less than `amount` finishes the request.
    fn do_recv(&mut self, amount: u32) -> u32;

    fn notify(&mut self) {}
}

/// A connection intent.
pub trait ConnRequest: Send {
    /// Attempt the connection once granted budget.
    fn do_conn(&mut self) -> ConnResult;

    /// Outgoing attempts are paced and counted; incoming are not.
    fn is_outgoing(&self) -> bool;

    fn notify(&mut self) {}
}

/// Shared validity flag between the scheduler and the request owner.
#[derive(Debug, Default)]
pub struct ReqHandle {
    invalidated: AtomicBool,
}

impl ReqHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the request dead; it is removed at its next visit.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        !self.invalidated.load(Ordering::Acquire)
    }
}

/// List entry: a request, its fixed score and its validity handle.
/// Equal scores are served in insertion order.
pub(crate) struct Entry<T> {
    pub score: f32,
    pub seq: u64,
    pub handle: Arc<ReqHandle>,
    pub req: T,
}

/// Sort score-descending, stable for equal scores.
pub(crate) fn sort_entries<T>(entries: &mut [Entry<T>]) {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_invalidation() {
        let h = ReqHandle::new();
        assert!(h.is_valid());
        h.invalidate();
        assert!(!h.is_valid());
    }

    #[test]
    fn entries_sort_desc_stable() {
        let mut entries: Vec<Entry<u32>> = [(1.0, 0), (3.0, 1), (1.0, 2), (2.0, 3)]
            .into_iter()
            .map(|(score, seq)| Entry { score, seq, handle: ReqHandle::new(), req: seq as u32 })
            .collect();
        sort_entries(&mut entries);
        let order: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }
}
