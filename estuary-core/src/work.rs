//! The dedicated I/O worker thread.
//!
//! The engine's main loop never blocks on disk: hashing and whole-file
//! moves are queued here and executed on one `std::thread` that owns a
//! FIFO of [`Work`] items. The worker touches only paths and byte
//! buffers, never engine state; results travel back to the main loop as
//! events.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{CoreEvent, EventQueue};
use crate::hasher::HashWork;
use crate::part::PartId;
use std::sync::Arc;

/// One queued work item.
pub enum Work {
    Hash(Arc<HashWork>),
    /// Move a finished download to its destination path.
    Move { part: PartId, from: PathBuf, to: PathBuf },
    /// Drain marker; ends the worker loop.
    Shutdown,
}

/// Clonable submission half of the work FIFO.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<Work>,
}

impl WorkQueue {
    /// Queue a hash job.
    pub fn hash(&self, job: Arc<HashWork>) {
        let _ = self.tx.send(Work::Hash(job));
    }

    /// Queue a file move.
    pub fn move_file(&self, part: PartId, from: PathBuf, to: PathBuf) {
        let _ = self.tx.send(Work::Move { part, from, to });
    }

    fn shutdown(&self) {
        let _ = self.tx.send(Work::Shutdown);
    }
}

/// Handle to the running worker thread.
pub struct WorkThread {
    queue: WorkQueue,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkThread {
    /// Spawn the worker. Completions are posted to `events`.
    pub fn spawn(events: EventQueue) -> Self {
        let (tx, rx) = mpsc::channel::<Work>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("estuary-io".into())
            .spawn(move || worker_loop(rx, events, token))
            .expect("spawn io worker");

        Self { queue: WorkQueue { tx }, cancel, handle: Some(handle) }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Stop the worker: cancel in-flight hashing at the next buffer
    /// boundary and join the thread.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkThread {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: mpsc::Receiver<Work>, events: EventQueue, cancel: CancellationToken) {
    while let Ok(work) = rx.recv() {
        match work {
            Work::Hash(job) => {
                if !job.is_valid() {
                    debug!(target: "estuary::work", path = %job.path().display(),
                        "discarding invalidated hash job");
                    continue;
                }
                // Invalidated mid-run: discard silently, no event.
                if job.process(&cancel).is_some() {
                    events.post(CoreEvent::HashDone(job));
                }
            }
            Work::Move { part, from, to } => {
                let error = move_file(&from, &to).err().map(|e| e.to_string());
                if let Some(err) = &error {
                    warn!(target: "estuary::work", %err, from = %from.display(),
                        to = %to.display(), "file move failed");
                }
                events.post(CoreEvent::MoveDone { part, dest: to, error });
            }
            Work::Shutdown => break,
        }
        if cancel.is_cancelled() {
            break;
        }
    }
}

/// Rename, falling back to copy-and-delete across devices.
fn move_file(from: &std::path::Path, to: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashOutcome;

    fn drain_one(rx: &mut crate::events::EventReceiver) -> CoreEvent {
        // The worker runs on its own thread; poll briefly.
        for _ in 0..200 {
            if let Ok(ev) = rx.try_recv() {
                return ev;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("no event from worker");
    }

    #[test]
    fn hash_job_completion_posted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [7u8; 1234]).unwrap();

        let (events, mut rx) = EventQueue::channel();
        let worker = WorkThread::spawn(events);

        let job = Arc::new(HashWork::full(&path));
        worker.queue().hash(job.clone());

        let ev = drain_one(&mut rx);
        let CoreEvent::HashDone(done) = ev else { panic!("expected HashDone") };
        assert!(Arc::ptr_eq(&done, &job));
        assert!(matches!(done.outcome(), Some(HashOutcome::Complete(_))));

        worker.shutdown();
    }

    #[test]
    fn invalidated_job_posts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [7u8; 100]).unwrap();

        let (events, mut rx) = EventQueue::channel();
        let worker = WorkThread::spawn(events);

        let job = Arc::new(HashWork::full(&path));
        job.invalidate();
        worker.queue().hash(job);
        worker.shutdown();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn move_work_relocates_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("incoming.part");
        let to = dir.path().join("done/incoming.bin");
        std::fs::write(&from, b"payload").unwrap();

        let (events, mut rx) = EventQueue::channel();
        let worker = WorkThread::spawn(events);
        worker.queue().move_file(PartId::from_raw(1), from.clone(), to.clone());

        let ev = drain_one(&mut rx);
        let CoreEvent::MoveDone { error, .. } = ev else { panic!("expected MoveDone") };
        assert!(error.is_none());
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");

        worker.shutdown();
    }

    #[test]
    fn move_failure_is_reported() {
        let (events, mut rx) = EventQueue::channel();
        let worker = WorkThread::spawn(events);
        worker.queue().move_file(
            PartId::from_raw(2),
            PathBuf::from("/nonexistent/source"),
            PathBuf::from("/nonexistent/dest"),
        );

        let ev = drain_one(&mut rx);
        let CoreEvent::MoveDone { error, .. } = ev else { panic!("expected MoveDone") };
        assert!(error.is_some());

        worker.shutdown();
    }
}
