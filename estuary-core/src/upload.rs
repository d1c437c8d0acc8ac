//! The upload queue.
//!
//! Peers asking to download from us wait in a queue that is fully
//! re-sorted on a fixed interval. An entry's effective score is
//! `(base_score + credit_score) * waiting time`, so good uploaders
//! overtake strangers of equal patience, and a peer rotated out after
//! its session starts over at the tail. Every resort writes each
//! peer's rank back so the protocol module can report queue positions.
//!
//! The number of upload slots is driven by the scheduler: while the
//! measured upload rate sits clearly below the configured limit,
//! another slot is opened; once the budget is reached the count holds.

use std::collections::HashMap;

use tracing::debug;

use crate::credits::CreditStore;

/// Full resort interval.
pub const RESORT_INTERVAL_MS: u64 = 10_000;

/// Peers that stopped re-asking are dropped after this long.
pub const GRACE_MS: u64 = 60 * 60 * 1_000;

/// Per-session byte budget before rotation; finishes a whole
/// hash-algorithm chunk so the recipient can verify and re-advertise.
pub const SESSION_BYTE_CAP: u64 = 9_540_000;

/// Open another slot while the measured rate is below this fraction
/// of the limit (in percent).
const SLOT_HEADROOM_PCT: u32 = 90;

/// Opaque queue identity of a peer, assigned by the protocol module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    peer: PeerId,
    base_score: f32,
    /// Credit-store key; empty for unknown peers.
    credit_key: Vec<u8>,
    /// Wait anchor: enqueue or last rotation time.
    waiting_since: u64,
    last_asked: u64,
    seq: u64,
    /// Effective score as of the last resort.
    score: f64,
    /// 1-based queue position as of the last resort.
    rank: u32,
}

/// An open upload slot.
#[derive(Debug, Clone)]
pub struct ActiveUpload {
    pub peer: PeerId,
    /// Bytes delivered this session.
    pub sent: u64,
    base_score: f32,
    credit_key: Vec<u8>,
}

/// Score-ordered waiting queue plus the active slot set.
pub struct UploadQueue {
    waiting: Vec<QueueEntry>,
    active: Vec<ActiveUpload>,
    ranks: HashMap<PeerId, u32>,
    slots: usize,
    seq: u64,
    next_resort: u64,
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadQueue {
    pub fn new() -> Self {
        Self {
            waiting: Vec::new(),
            active: Vec::new(),
            ranks: HashMap::new(),
            slots: 1,
            seq: 0,
            next_resort: 0,
        }
    }

    // ── Peer lifecycle ───────────────────────────────────────────

    /// A peer asked (or re-asked) for an upload slot. Returns its
    /// rank as of the last resort, 0 when not ranked yet.
    pub fn ask(&mut self, peer: PeerId, base_score: f32, credit_key: &[u8], now: u64) -> u32 {
        if self.active.iter().any(|a| a.peer == peer) {
            return 0;
        }
        if let Some(entry) = self.waiting.iter_mut().find(|e| e.peer == peer) {
            entry.last_asked = now;
            entry.base_score = base_score;
            return entry.rank;
        }
        self.seq += 1;
        self.waiting.push(QueueEntry {
            peer,
            base_score,
            credit_key: credit_key.to_vec(),
            waiting_since: now,
            last_asked: now,
            seq: self.seq,
            score: 0.0,
            rank: 0,
        });
        0
    }

    /// Drop a peer entirely (disconnect, ban).
    pub fn remove(&mut self, peer: PeerId) {
        self.waiting.retain(|e| e.peer != peer);
        self.active.retain(|a| a.peer != peer);
        self.ranks.remove(&peer);
    }

    pub fn is_active(&self, peer: PeerId) -> bool {
        self.active.iter().any(|a| a.peer == peer)
    }

    /// Rank of a waiting peer as of the last resort (1-based);
    /// 0 for active or unknown peers.
    pub fn rank_of(&self, peer: PeerId) -> u32 {
        self.ranks.get(&peer).copied().unwrap_or(0)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_uploads(&self) -> &[ActiveUpload] {
        &self.active
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    // ── Periodic maintenance ─────────────────────────────────────

    pub fn resort_due(&self, now: u64) -> bool {
        now >= self.next_resort
    }

    /// Full resort: evict silent peers, recompute scores, rewrite
    /// ranks and promote into free slots.
    pub fn resort(&mut self, credits: &CreditStore, now: u64) -> Vec<PeerId> {
        self.next_resort = now + RESORT_INTERVAL_MS;

        let before = self.waiting.len();
        self.waiting.retain(|e| now.saturating_sub(e.last_asked) <= GRACE_MS);
        if self.waiting.len() != before {
            debug!(target: "estuary::upload", dropped = before - self.waiting.len(),
                "queue grace eviction");
        }

        for entry in self.waiting.iter_mut() {
            let credit = credits.score_of(&entry.credit_key) as f64;
            let waited = now.saturating_sub(entry.waiting_since) as f64;
            entry.score = (entry.base_score as f64 + credit) * waited;
        }
        // Score-descending, insertion order for ties.
        self.waiting.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });

        self.ranks.clear();
        for (i, entry) in self.waiting.iter_mut().enumerate() {
            entry.rank = i as u32 + 1;
            self.ranks.insert(entry.peer, entry.rank);
        }

        self.promote()
    }

    /// Promote waiting peers into free slots; returns the promoted
    /// peers so the module can open their sockets.
    fn promote(&mut self) -> Vec<PeerId> {
        let mut promoted = Vec::new();
        while self.active.len() < self.slots && !self.waiting.is_empty() {
            let entry = self.waiting.remove(0);
            self.ranks.remove(&entry.peer);
            promoted.push(entry.peer);
            self.active.push(ActiveUpload {
                peer: entry.peer,
                sent: 0,
                base_score: entry.base_score,
                credit_key: entry.credit_key,
            });
        }
        promoted
    }

    /// Let the measured upload rate drive the slot count: open another
    /// slot while we are clearly under budget, hold otherwise.
    pub fn tune_slots(&mut self, actual_rate: u32, limit: u32) {
        if limit == 0 {
            return;
        }
        let filled = self.active.len() >= self.slots;
        if filled && (actual_rate as u64) * 100 < (limit as u64) * SLOT_HEADROOM_PCT as u64 {
            self.slots += 1;
            debug!(target: "estuary::upload", slots = self.slots, "opened upload slot");
        }
    }

    // ── Session accounting ───────────────────────────────────────

    /// Count bytes delivered to an active peer. At the session cap the
    /// peer is rotated back to the queue tail; returns true when that
    /// happened.
    pub fn record_sent(&mut self, peer: PeerId, bytes: u64, now: u64) -> bool {
        let Some(slot) = self.active.iter_mut().find(|a| a.peer == peer) else {
            return false;
        };
        slot.sent += bytes;
        if slot.sent < SESSION_BYTE_CAP {
            return false;
        }

        // Session over: back to the tail with a fresh wait anchor.
        let (base_score, credit_key) = (slot.base_score, slot.credit_key.clone());
        self.active.retain(|a| a.peer != peer);
        self.waiting.retain(|e| e.peer != peer);
        self.seq += 1;
        self.waiting.push(QueueEntry {
            peer,
            base_score,
            credit_key,
            waiting_since: now,
            last_asked: now,
            seq: self.seq,
            score: 0.0,
            rank: 0,
        });
        debug!(target: "estuary::upload", ?peer, "session cap reached; rotated to tail");
        true
    }
}
