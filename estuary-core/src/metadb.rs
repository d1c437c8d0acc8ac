//! Process-wide metadata index.
//!
//! Cross-references [`MetaData`] records by content hash, file name and
//! shared-file id. Inserts are idempotent: a record whose file hashes
//! overlap an existing record is merged into it (and if it bridges
//! several records, those are merged together). Records are removed
//! only when the owning shared file goes away and nothing else refers
//! to them.
//!
//! Persisted as a length-prefixed binary stream; a corrupt database
//! falls back to the `.bak` copy written by the previous save.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::hash::HashValue;
use crate::metadata::MetaData;
use crate::sharedfile::FileId;
use crate::wire::{Reader, Writer};

/// Stream version byte.
const MDB_VERSION: u8 = 0x01;

/// Stable handle to a record in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaId(u64);

/// The metadata database.
#[derive(Default)]
pub struct MetaDb {
    records: HashMap<MetaId, MetaData>,
    next_id: u64,

    /// hash -> record; unique per (algorithm, value).
    by_hash: HashMap<HashValue, MetaId>,
    /// name -> records; multi-valued.
    by_name: HashMap<String, BTreeSet<MetaId>>,
    /// live shared file -> record; at most one per file.
    by_file: HashMap<FileId, MetaId>,

    /// hash -> shared file, name -> shared files.
    file_by_hash: HashMap<HashValue, FileId>,
    files_by_name: HashMap<String, BTreeSet<FileId>>,
}

impl MetaDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = MetaId> + '_ {
        self.records.keys().copied()
    }

    pub fn get(&self, id: MetaId) -> Option<&MetaData> {
        self.records.get(&id)
    }

    // ── Insertion ────────────────────────────────────────────────

    /// Add a record, merging it into any record sharing a file hash.
    /// Returns the id of the (possibly pre-existing) record.
    pub fn insert(&mut self, md: MetaData) -> MetaId {
        // All records whose identity overlaps the incoming one.
        let mut hits: Vec<MetaId> = Vec::new();
        for hash in md.file_hashes() {
            if let Some(&id) = self.by_hash.get(hash) {
                if !hits.contains(&id) {
                    hits.push(id);
                }
            }
        }

        let target = match hits.first() {
            Some(&id) => id,
            None => {
                let id = MetaId(self.next_id);
                self.next_id += 1;
                self.records.insert(id, MetaData::default());
                id
            }
        };

        // The incoming record bridged several existing records: fold
        // the extras into the target before merging it in.
        for &extra in hits.iter().skip(1) {
            let folded = self.unlink(extra);
            if let Some(folded) = folded {
                let rec = self.records.get_mut(&target).expect("target record");
                rec.merge(folded);
            }
        }

        {
            let rec = self.records.get_mut(&target).expect("target record");
            rec.merge(md);
        }
        self.reindex(target);
        target
    }

    /// Associate a record with a live shared file, wiring the
    /// file-lookup dimensions.
    pub fn associate(&mut self, id: MetaId, file: FileId) {
        let Some(rec) = self.records.get(&id) else { return };
        self.by_file.insert(file, id);
        let hashes: Vec<HashValue> = rec.file_hashes().copied().collect();
        let names: Vec<String> = rec.names().iter().map(|n| n.name.clone()).collect();
        for h in hashes {
            self.file_by_hash.insert(h, file);
        }
        for n in names {
            self.files_by_name.entry(n).or_default().insert(file);
        }
    }

    /// Drop every cross-reference involving a shared file. The record
    /// itself stays in the database.
    pub fn remove_file(&mut self, file: FileId) {
        self.by_file.remove(&file);
        self.file_by_hash.retain(|_, f| *f != file);
        self.files_by_name.retain(|_, set| {
            set.remove(&file);
            !set.is_empty()
        });
    }

    /// Remove a record outright (used when its last referent is gone).
    pub fn remove(&mut self, id: MetaId) -> Option<MetaData> {
        let md = self.unlink(id)?;
        self.by_file.retain(|_, v| *v != id);
        Some(md)
    }

    /// Register an additional name on a record, keeping indices fresh.
    pub fn add_name(&mut self, id: MetaId, name: &str) {
        if let Some(rec) = self.records.get_mut(&id) {
            rec.add_name(name);
            self.by_name.entry(name.to_string()).or_default().insert(id);
            if let Some(&file) = self.by_file.iter().find_map(|(f, i)| (*i == id).then_some(f)) {
                self.files_by_name.entry(name.to_string()).or_default().insert(file);
            }
        }
    }

    /// Drop one use of a name; indices are updated when it retires.
    pub fn release_name(&mut self, id: MetaId, name: &str) {
        let Some(rec) = self.records.get_mut(&id) else { return };
        if rec.release_name(name) {
            if let Some(set) = self.by_name.get_mut(name) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_name.remove(name);
                }
            }
        }
    }

    // ── Lookups ──────────────────────────────────────────────────

    pub fn find_by_hash(&self, hash: &HashValue) -> Option<&MetaData> {
        self.id_by_hash(hash).and_then(|id| self.records.get(&id))
    }

    pub fn id_by_hash(&self, hash: &HashValue) -> Option<MetaId> {
        self.by_hash.get(hash).copied()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<&MetaData> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn ids_by_name(&self, name: &str) -> Vec<MetaId> {
        self.by_name.get(name).into_iter().flatten().copied().collect()
    }

    pub fn find_by_file(&self, file: FileId) -> Option<&MetaData> {
        self.by_file.get(&file).and_then(|id| self.records.get(id))
    }

    pub fn id_by_file(&self, file: FileId) -> Option<MetaId> {
        self.by_file.get(&file).copied()
    }

    pub fn find_file_by_hash(&self, hash: &HashValue) -> Option<FileId> {
        self.file_by_hash.get(hash).copied()
    }

    pub fn find_files_by_name(&self, name: &str) -> Vec<FileId> {
        self.files_by_name.get(name).into_iter().flatten().copied().collect()
    }

    // ── Persistence ──────────────────────────────────────────────

    pub fn save(&self, w: &mut Writer) {
        w.u8(MDB_VERSION);
        w.u32(self.records.len() as u32);
        // Stable order keeps saves byte-comparable between runs.
        let mut ids: Vec<&MetaId> = self.records.keys().collect();
        ids.sort();
        for id in ids {
            self.records[id].encode(w);
        }
    }

    /// Load records from a stream, merging them into the database.
    pub fn load(&mut self, r: &mut Reader<'_>) -> Result<usize, CoreError> {
        let ver = r.u8("metadb version")?;
        if ver != MDB_VERSION {
            return Err(CoreError::UnknownVariant { what: "metadb version", value: ver as u64 });
        }
        let count = r.u32("metadb record count")?;
        let mut added = 0usize;
        for _ in 0..count {
            let md = MetaData::decode(r)?;
            // Nameless records carry nothing worth indexing.
            if md.name().is_none() {
                continue;
            }
            self.insert(md);
            added += 1;
        }
        debug!(target: "estuary::metadb", added, "loaded metadb records");
        Ok(added)
    }

    /// Load from `path`, falling back to `path.bak` when the primary
    /// copy is corrupt. A persistent failure disables persistence for
    /// the session rather than aborting startup.
    pub fn load_file(&mut self, path: &Path) -> usize {
        for (candidate, label) in [(path.to_path_buf(), "primary"), (bak_path(path), "backup")] {
            let Ok(raw) = std::fs::read(&candidate) else { continue };
            match self.load(&mut Reader::new(&raw)) {
                Ok(added) => {
                    info!(
                        target: "estuary::metadb",
                        entries = added,
                        from = label,
                        "metadb loaded"
                    );
                    return added;
                }
                Err(err) => {
                    warn!(
                        target: "estuary::metadb",
                        %err,
                        from = label,
                        "corrupt metadb stream"
                    );
                }
            }
        }
        0
    }

    /// Save to `path`, first rotating the previous copy to `.bak`.
    pub fn save_file(&self, path: &Path) -> Result<(), CoreError> {
        if path.exists() {
            let _ = std::fs::rename(path, bak_path(path));
        }
        let mut w = Writer::new();
        self.save(&mut w);
        std::fs::write(path, w.as_slice())?;
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Remove a record and all its non-file indices, returning it.
    fn unlink(&mut self, id: MetaId) -> Option<MetaData> {
        let md = self.records.remove(&id)?;
        self.by_hash.retain(|_, v| *v != id);
        self.by_name.retain(|_, set| {
            set.remove(&id);
            !set.is_empty()
        });
        Some(md)
    }

    /// Refresh hash and name indices for a record after a merge.
    fn reindex(&mut self, id: MetaId) {
        let Some(rec) = self.records.get(&id) else { return };
        let hashes: Vec<HashValue> = rec.file_hashes().copied().collect();
        let names: Vec<String> = rec.names().iter().map(|n| n.name.clone()).collect();
        let file = self.by_file.iter().find_map(|(f, i)| (*i == id).then_some(*f));
        for h in hashes {
            self.by_hash.insert(h, id);
            if let Some(f) = file {
                self.file_by_hash.insert(h, f);
            }
        }
        for n in names {
            self.by_name.entry(n.clone()).or_default().insert(id);
            if let Some(f) = file {
                self.files_by_name.entry(n).or_default().insert(f);
            }
        }
    }
}

fn bak_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;
    use crate::hashset::HashSet;

    fn hash(algo: HashAlgo, b: u8) -> HashValue {
        let mut digest = vec![b; algo.digest_len()];
        digest[0] = algo as u8;
        HashValue::new(algo, &digest).unwrap()
    }

    fn record(name: &str, hashes: &[(HashAlgo, u8)]) -> MetaData {
        let mut md = MetaData::new(1000, 0);
        md.add_name(name);
        for &(algo, b) in hashes {
            md.add_hash_set(HashSet::file_only(hash(algo, b)));
        }
        md
    }

    #[test]
    fn find_by_each_hash() {
        let mut db = MetaDb::new();
        let id = db.insert(record("f", &[(HashAlgo::Ed2k, 1), (HashAlgo::Sha1, 2)]));

        assert_eq!(db.id_by_hash(&hash(HashAlgo::Ed2k, 1)), Some(id));
        assert_eq!(db.id_by_hash(&hash(HashAlgo::Sha1, 2)), Some(id));
        assert!(db.id_by_hash(&hash(HashAlgo::Md5, 3)).is_none());
    }

    #[test]
    fn dedup_scenario() {
        // Two records sharing a name stay distinct; a third sharing a
        // hash merges.
        let mut db = MetaDb::new();
        let m1 = db.insert(record("f", &[(HashAlgo::Ed2k, 1), (HashAlgo::Sha1, 2)]));
        let m2 = db.insert(record("f", &[(HashAlgo::Md5, 3)]));
        assert_ne!(m1, m2);
        assert_eq!(db.find_by_name("f").len(), 2);

        let m3 = db.insert(record("g", &[(HashAlgo::Ed2k, 1)]));
        assert_eq!(m3, m1);
        assert_eq!(db.len(), 2);

        let merged = db.find_by_hash(&hash(HashAlgo::Ed2k, 1)).unwrap();
        assert!(merged.names().iter().any(|n| n.name == "f"));
        assert!(merged.names().iter().any(|n| n.name == "g"));
        assert!(merged.hash_set(HashAlgo::Sha1).is_some());
    }

    #[test]
    fn bridging_insert_folds_records() {
        let mut db = MetaDb::new();
        let a = db.insert(record("a", &[(HashAlgo::Ed2k, 1)]));
        let b = db.insert(record("b", &[(HashAlgo::Sha1, 2)]));
        assert_ne!(a, b);

        // One record carrying both hashes proves a and b are the same
        // content.
        let bridge = db.insert(record("c", &[(HashAlgo::Ed2k, 1), (HashAlgo::Sha1, 2)]));
        assert_eq!(db.len(), 1);
        assert_eq!(db.id_by_hash(&hash(HashAlgo::Sha1, 2)), Some(bridge));
        let rec = db.get(bridge).unwrap();
        assert_eq!(rec.names().len(), 3);
    }

    #[test]
    fn shared_file_dimension() {
        let mut db = MetaDb::new();
        let id = db.insert(record("f", &[(HashAlgo::Ed2k, 1)]));
        let file = FileId::from_raw(7);
        db.associate(id, file);

        assert_eq!(db.id_by_file(file), Some(id));
        assert_eq!(db.find_file_by_hash(&hash(HashAlgo::Ed2k, 1)), Some(file));
        assert_eq!(db.find_files_by_name("f"), vec![file]);

        db.remove_file(file);
        assert!(db.id_by_file(file).is_none());
        assert!(db.find_file_by_hash(&hash(HashAlgo::Ed2k, 1)).is_none());
        // The record itself survives.
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn save_load_roundtrip() {
        let mut db = MetaDb::new();
        db.insert(record("f", &[(HashAlgo::Ed2k, 1)]));
        db.insert(record("g", &[(HashAlgo::Sha1, 2)]));

        let mut w = Writer::new();
        db.save(&mut w);
        let bytes = w.into_vec();

        let mut fresh = MetaDb::new();
        let added = fresh.load(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(added, 2);
        assert!(fresh.find_by_hash(&hash(HashAlgo::Ed2k, 1)).is_some());
        assert!(fresh.find_by_hash(&hash(HashAlgo::Sha1, 2)).is_some());
    }

    #[test]
    fn corrupt_stream_keeps_prior_state() {
        let mut db = MetaDb::new();
        db.insert(record("f", &[(HashAlgo::Ed2k, 1)]));

        let garbage = [0xFFu8, 0x00, 0x01];
        assert!(db.load(&mut Reader::new(&garbage)).is_err());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn bak_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadb.dat");

        let mut db = MetaDb::new();
        db.insert(record("f", &[(HashAlgo::Ed2k, 1)]));
        db.save_file(&path).unwrap();
        // Second save rotates the good copy to .bak.
        db.save_file(&path).unwrap();

        std::fs::write(&path, b"garbage").unwrap();
        let mut fresh = MetaDb::new();
        assert_eq!(fresh.load_file(&path), 1);
    }
}
