//! Cross-subsystem event delivery.
//!
//! Subsystems post typed [`CoreEvent`]s onto an unbounded channel; the
//! main loop drains them at the start of each tick and routes them to
//! the interested services. The same channel carries completions from
//! the I/O worker thread back onto the main thread, which is the only
//! place engine state is mutated.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::hasher::HashWork;
use crate::metadb::MetaId;
use crate::part::{PartId, PartState};
use crate::sharedfile::FileId;

/// Events observable on a partial file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartEvent {
    /// Bytes were written through a lock.
    DataAdded { begin: u64, len: u64 },
    /// A verified-to-be-bad region was re-opened for download.
    Corruption { begin: u64, len: u64 },
    StateChanged(PartState),
    /// The file finished moving to its destination path.
    Completed,
}

/// The engine-wide event type.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Part { part: PartId, event: PartEvent },
    /// A hash job finished; the job carries its outcome. Posted from
    /// the worker thread in completion order, which is not submission
    /// order.
    HashDone(Arc<HashWork>),
    /// A file move finished (or failed).
    MoveDone { part: PartId, dest: PathBuf, error: Option<String> },
    MetaAdded(MetaId),
    FileAdded(FileId),
    FileRemoved(FileId),
    ConfigChanged { key: String, value: String },
}

/// Clonable posting half of the event channel.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<CoreEvent>;

impl EventQueue {
    pub fn channel() -> (EventQueue, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventQueue { tx }, rx)
    }

    /// Post an event. Posting after the receiver is gone (shutdown) is
    /// silently dropped; nothing is listening anymore.
    pub fn post(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventQueue")
    }
}
