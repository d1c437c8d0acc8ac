//! Files offered to the networks.
//!
//! A [`SharedFile`] is one piece of content we serve: a complete file
//! on disk, or a download in progress backed by a [`PartData`]. Dedup
//! discovery may attach several equivalent on-disk locations to one
//! record. Metadata resolves lazily once hashing finishes.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreError;
use crate::metadb::MetaId;
use crate::part::PartData;

/// Stable handle to a shared file; the metadata index cross-references
/// by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// One shared file, complete or partial.
pub struct SharedFile {
    id: FileId,
    /// Equivalent on-disk locations; the first is canonical.
    locations: Vec<PathBuf>,
    size: u64,
    /// Present while the file is still downloading.
    part: Option<Arc<PartData>>,
    /// Resolved after hashing.
    meta: Option<MetaId>,
}

impl SharedFile {
    /// A complete file already on disk.
    pub fn complete(id: FileId, path: impl Into<PathBuf>, size: u64) -> Self {
        Self { id, locations: vec![path.into()], size, part: None, meta: None }
    }

    /// A download in progress; the canonical location is the
    /// destination path.
    pub fn downloading(id: FileId, part: Arc<PartData>) -> Self {
        let dest = part.dest();
        let size = part.size();
        Self { id, locations: vec![dest], size, part: Some(part), meta: None }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.locations[0]
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Record another on-disk copy of the same content.
    pub fn add_location(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.locations.contains(&path) {
            self.locations.push(path);
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_partial(&self) -> bool {
        self.part.is_some()
    }

    pub fn part(&self) -> Option<&Arc<PartData>> {
        self.part.as_ref()
    }

    /// Detach the partial state once the download completed; the
    /// canonical location is then the destination file.
    pub fn finish_download(&mut self) {
        self.part = None;
    }

    pub fn meta(&self) -> Option<MetaId> {
        self.meta
    }

    pub fn set_meta(&mut self, meta: MetaId) {
        self.meta = Some(meta);
    }

    /// Read `[begin, end]` inclusive: from the partial storage while
    /// downloading, from the destination file once complete.
    pub fn read(&self, begin: u64, end: u64) -> Result<Vec<u8>, CoreError> {
        if begin > end || end >= self.size {
            return Err(CoreError::RangeConflict("read out of file bounds"));
        }
        if let Some(part) = &self.part {
            return part.read(begin, end);
        }
        let mut file = File::open(self.path())?;
        file.seek(SeekFrom::Start(begin))?;
        let mut out = vec![0u8; (end - begin + 1) as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFile")
            .field("id", &self.id)
            .field("path", &self.locations[0])
            .field("size", &self.size)
            .field("partial", &self.is_partial())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<u8>>()).unwrap();

        let sf = SharedFile::complete(FileId::from_raw(1), &path, 256);
        assert!(!sf.is_partial());
        assert_eq!(sf.read(10, 13).unwrap(), vec![10, 11, 12, 13]);
        assert!(sf.read(0, 256).is_err());
    }

    #[test]
    fn locations_dedup() {
        let mut sf = SharedFile::complete(FileId::from_raw(1), "/a/x.bin", 10);
        sf.add_location("/b/x.bin");
        sf.add_location("/a/x.bin");
        assert_eq!(sf.locations().len(), 2);
    }
}
