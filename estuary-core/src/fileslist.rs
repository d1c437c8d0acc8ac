//! The shared-files service.
//!
//! Owns every [`SharedFile`] in the session: complete files picked up
//! from shared directories and downloads in progress. New files are
//! hashed in the background; the resulting metadata lands in the
//! [`MetaDb`] and is cross-referenced with the owning file. Partial
//! downloads are resumed from their `.dat` sidecars on startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::CoreError;
use crate::events::{CoreEvent, EventQueue};
use crate::hasher::{HashOutcome, HashWork};
use crate::metadata::MetaData;
use crate::metadb::MetaDb;
use crate::part::{PartData, PartId};
use crate::sharedfile::{FileId, SharedFile};
use crate::work::WorkQueue;

/// The files list service.
pub struct FilesList {
    files: HashMap<FileId, SharedFile>,
    next_id: u64,
    events: EventQueue,
    work: WorkQueue,
    /// Full-hash jobs in flight, with the file they belong to.
    pending: Vec<(Arc<HashWork>, FileId)>,
}

impl FilesList {
    pub fn new(events: EventQueue, work: WorkQueue) -> Self {
        Self { files: HashMap::new(), next_id: 1, events, work, pending: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, id: FileId) -> Option<&SharedFile> {
        self.files.get(&id)
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut SharedFile> {
        self.files.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedFile> {
        self.files.values()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&SharedFile> {
        self.files.values().find(|f| f.locations().iter().any(|l| l == path))
    }

    /// The partial file with a given part id, if any.
    pub fn part_by_id(&self, part: PartId) -> Option<&Arc<PartData>> {
        self.files
            .values()
            .filter_map(|f| f.part())
            .find(|p| p.id() == part)
    }

    /// The shared file owning a given part.
    pub fn file_of_part(&self, part: PartId) -> Option<FileId> {
        self.files
            .values()
            .find(|f| f.part().is_some_and(|p| p.id() == part))
            .map(|f| f.id())
    }

    // ── Adding content ───────────────────────────────────────────

    /// Share one complete on-disk file; hashing is queued in the
    /// background. Re-sharing a known path is a no-op.
    pub fn add_shared_file(&mut self, path: impl Into<PathBuf>) -> Result<FileId, CoreError> {
        let path = path.into();
        if let Some(existing) = self.find_by_path(&path) {
            return Ok(existing.id());
        }
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(CoreError::Stream("not a shareable file"));
        }

        let id = self.alloc_id();
        self.files.insert(id, SharedFile::complete(id, &path, meta.len()));

        let job = Arc::new(HashWork::full(&path));
        self.pending.push((Arc::clone(&job), id));
        self.work.hash(job);

        self.events.post(CoreEvent::FileAdded(id));
        debug!(target: "estuary::files", file = %id, path = %path.display(), "file shared");
        Ok(id)
    }

    /// Recursively share a directory. Unreadable entries are skipped;
    /// returns how many files were added.
    pub fn add_shared_dir(&mut self, dir: &Path) -> usize {
        let mut added = 0usize;
        for entry in WalkDir::new(dir).follow_links(false).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            // Working files and sidecars of our own downloads are not
            // shareable content.
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".part") || name.ends_with(".part.dat") {
                continue;
            }
            match self.add_shared_file(entry.path()) {
                Ok(_) => added += 1,
                Err(err) => {
                    debug!(target: "estuary::files", path = %entry.path().display(),
                        %err, "skipping unshareable entry");
                }
            }
        }
        info!(target: "estuary::files", dir = %dir.display(), added, "shared directory scanned");
        added
    }

    /// Start a new download.
    pub fn create_download(
        &mut self,
        dest: impl Into<PathBuf>,
        size: u64,
        meta: Option<&MetaData>,
    ) -> Result<FileId, CoreError> {
        let part = PartData::create(dest, size, meta, self.events.clone(), self.work.clone())?;
        let id = self.alloc_id();
        self.files.insert(id, SharedFile::downloading(id, part));
        self.events.post(CoreEvent::FileAdded(id));
        Ok(id)
    }

    /// Resume downloads from `.dat` sidecars under `dir`. Corrupt
    /// sidecars are skipped with a warning.
    pub fn resume_downloads(&mut self, dir: &Path) -> usize {
        let mut resumed = 0usize;
        for entry in WalkDir::new(dir).max_depth(1).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file()
                || !entry.file_name().to_string_lossy().ends_with(".part.dat")
            {
                continue;
            }
            match PartData::load(entry.path(), self.events.clone(), self.work.clone()) {
                Ok(part) => {
                    let id = self.alloc_id();
                    self.files.insert(id, SharedFile::downloading(id, part));
                    self.events.post(CoreEvent::FileAdded(id));
                    resumed += 1;
                }
                Err(err) => {
                    warn!(target: "estuary::files", sidecar = %entry.path().display(),
                        %err, "unresumable download");
                }
            }
        }
        if resumed > 0 {
            info!(target: "estuary::files", resumed, "downloads resumed");
        }
        resumed
    }

    // ── Removal ──────────────────────────────────────────────────

    /// Stop sharing a file. Cancels a running download (erasing its
    /// partial data); the on-disk content of complete files stays.
    pub fn remove(&mut self, id: FileId, metadb: &mut MetaDb) {
        let Some(file) = self.files.remove(&id) else { return };
        if let Some(part) = file.part() {
            part.cancel();
        }
        metadb.remove_file(id);
        self.pending.retain(|(job, owner)| {
            if *owner == id {
                job.invalidate();
                false
            } else {
                true
            }
        });
        self.events.post(CoreEvent::FileRemoved(id));
    }

    // ── Event routing ────────────────────────────────────────────

    /// Handle a completed full-hash job: index the fresh metadata and
    /// attach it to the owning file.
    pub fn on_hash_done(&mut self, job: &Arc<HashWork>, metadb: &mut MetaDb) {
        let Some(pos) = self.pending.iter().position(|(p, _)| Arc::ptr_eq(p, job)) else {
            return;
        };
        let (job, id) = self.pending.remove(pos);
        if !job.is_valid() {
            return;
        }
        match job.outcome() {
            Some(HashOutcome::Complete(md)) => {
                let meta_id = metadb.insert(md);
                metadb.associate(meta_id, id);
                if let Some(file) = self.files.get_mut(&id) {
                    file.set_meta(meta_id);
                }
                self.events.post(CoreEvent::MetaAdded(meta_id));
            }
            Some(HashOutcome::Fatal(err)) => {
                warn!(target: "estuary::files", file = %id, %err,
                    "hashing failed; unsharing file");
                self.remove(id, metadb);
            }
            _ => {}
        }
    }

    /// Route a part event to its owner (move completions).
    pub fn on_move_done(&mut self, part: PartId, error: Option<&str>) {
        if let Some(p) = self.part_by_id(part) {
            let p = Arc::clone(p);
            p.on_move_done(error);
            if error.is_none() {
                if let Some(id) = self.file_of_part(part) {
                    if let Some(file) = self.files.get_mut(&id) {
                        file.finish_download();
                    }
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Persist every partial download's sidecar.
    pub fn save_all(&self) {
        for file in self.files.values() {
            if let Some(part) = file.part() {
                if let Err(err) = part.save() {
                    warn!(target: "estuary::files", file = %file.id(), %err,
                        "sidecar save failed");
                }
            }
        }
    }

    fn alloc_id(&mut self) -> FileId {
        let id = FileId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::work::WorkThread;

    fn fixture() -> (tempfile::TempDir, EventQueue, EventReceiver, WorkThread) {
        let dir = tempfile::tempdir().unwrap();
        let (events, rx) = EventQueue::channel();
        let worker = WorkThread::spawn(events.clone());
        (dir, events, rx, worker)
    }

    fn wait_hash_done(rx: &mut EventReceiver) -> Arc<HashWork> {
        for _ in 0..400 {
            match rx.try_recv() {
                Ok(CoreEvent::HashDone(job)) => return job,
                Ok(_) => continue,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        panic!("no HashDone event");
    }

    #[test]
    fn share_hash_and_index() {
        let (dir, events, mut rx, worker) = fixture();
        let path = dir.path().join("content.bin");
        std::fs::write(&path, [0x42u8; 10_000]).unwrap();

        let mut files = FilesList::new(events, worker.queue());
        let mut metadb = MetaDb::new();
        let id = files.add_shared_file(&path).unwrap();

        let job = wait_hash_done(&mut rx);
        files.on_hash_done(&job, &mut metadb);

        let file = files.get(id).unwrap();
        let meta_id = file.meta().expect("meta resolved");
        let md = metadb.get(meta_id).unwrap();
        assert_eq!(md.size(), 10_000);
        assert_eq!(md.name(), Some("content.bin"));
        // The cross-reference dimensions resolve both ways.
        assert_eq!(metadb.id_by_file(id), Some(meta_id));
        assert_eq!(metadb.find_files_by_name("content.bin"), vec![id]);
    }

    #[test]
    fn reshare_is_idempotent() {
        let (dir, events, _rx, worker) = fixture();
        let path = dir.path().join("content.bin");
        std::fs::write(&path, [1u8; 100]).unwrap();

        let mut files = FilesList::new(events, worker.queue());
        let a = files.add_shared_file(&path).unwrap();
        let b = files.add_shared_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn dir_scan_skips_working_files() {
        let (dir, events, _rx, worker) = fixture();
        std::fs::write(dir.path().join("keep.bin"), [1u8; 10]).unwrap();
        std::fs::write(dir.path().join("dl.bin.part"), [1u8; 10]).unwrap();
        std::fs::write(dir.path().join("dl.bin.part.dat"), [1u8; 10]).unwrap();

        let mut files = FilesList::new(events, worker.queue());
        let added = files.add_shared_dir(dir.path());
        assert_eq!(added, 1);
    }

    #[test]
    fn download_roundtrip_through_list() {
        let (dir, events, _rx, worker) = fixture();
        let mut files = FilesList::new(events, worker.queue());

        let id = files.create_download(dir.path().join("get.bin"), 5_000, None).unwrap();
        let file = files.get(id).unwrap();
        assert!(file.is_partial());
        let part = Arc::clone(file.part().unwrap());

        let used = part.get_range(5_000, None).unwrap();
        let lock = used.get_lock(5_000).unwrap();
        lock.write(0, &[9u8; 2_500]).unwrap();
        assert_eq!(file.read(0, 2_499).unwrap(), vec![9u8; 2_500]);
    }

    #[test]
    fn resume_from_sidecars() {
        let (dir, events, _rx, worker) = fixture();
        let mut files = FilesList::new(events.clone(), worker.queue());
        let id = files.create_download(dir.path().join("get.bin"), 5_000, None).unwrap();
        files.get(id).unwrap().part().unwrap().save().unwrap();

        let mut fresh = FilesList::new(events, worker.queue());
        assert_eq!(fresh.resume_downloads(dir.path()), 1);
        let resumed = fresh.iter().next().unwrap();
        assert!(resumed.is_partial());
        assert_eq!(resumed.size(), 5_000);
    }

    #[test]
    fn remove_cancels_and_unindexes() {
        let (dir, events, mut rx, worker) = fixture();
        let path = dir.path().join("content.bin");
        std::fs::write(&path, [3u8; 1_000]).unwrap();

        let mut files = FilesList::new(events, worker.queue());
        let mut metadb = MetaDb::new();
        let id = files.add_shared_file(&path).unwrap();
        let job = wait_hash_done(&mut rx);
        files.on_hash_done(&job, &mut metadb);

        files.remove(id, &mut metadb);
        assert!(files.get(id).is_none());
        assert!(metadb.id_by_file(id).is_none());
        // The record itself survives in the index.
        assert_eq!(metadb.len(), 1);
    }
}
