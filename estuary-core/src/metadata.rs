//! Per-file identity records.
//!
//! A [`MetaData`] describes one piece of content: total size, last known
//! modification date, every file name it has been seen under (with use
//! counts), one hashset per algorithm family, and optional typed
//! sub-records for media attributes. Names and hashsets are additive;
//! a name is retired only when its use count drops to zero.

use crate::error::CoreError;
use crate::hash::{HashAlgo, HashValue};
use crate::hashset::HashSet;
use crate::wire::{op, Reader, Writer};

// ── Typed sub-records ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioData {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub bitrate: u32,
    pub length_secs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoData {
    pub codec: String,
    pub bitrate: u32,
    pub length_secs: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveData {
    pub file_count: u32,
    pub uncompressed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamData {
    pub codec: String,
    pub bitrate: u32,
    pub length_secs: u32,
}

/// One optional sub-record per media family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubRecord {
    Audio(AudioData),
    Video(VideoData),
    Image(ImageData),
    Archive(ArchiveData),
    Stream(StreamData),
}

impl SubRecord {
    fn opcode(&self) -> u8 {
        match self {
            SubRecord::Audio(_) => op::MD_AUDIO,
            SubRecord::Video(_) => op::MD_VIDEO,
            SubRecord::Image(_) => op::MD_IMAGE,
            SubRecord::Archive(_) => op::MD_ARCHIVE,
            SubRecord::Stream(_) => op::MD_STREAM,
        }
    }

    fn encode(&self, w: &mut Writer) {
        let mut p = Writer::new();
        match self {
            SubRecord::Audio(a) => {
                p.string(&a.title).string(&a.artist).string(&a.album);
                p.u32(a.bitrate).u32(a.length_secs);
            }
            SubRecord::Video(v) => {
                p.string(&v.codec);
                p.u32(v.bitrate).u32(v.length_secs).u32(v.width).u32(v.height);
            }
            SubRecord::Image(i) => {
                p.u32(i.width).u32(i.height);
            }
            SubRecord::Archive(a) => {
                p.u32(a.file_count).u64(a.uncompressed);
            }
            SubRecord::Stream(s) => {
                p.string(&s.codec);
                p.u32(s.bitrate).u32(s.length_secs);
            }
        }
        w.tag(self.opcode(), p.as_slice());
    }

    fn decode(opcode: u8, r: &mut Reader<'_>) -> Result<Option<Self>, CoreError> {
        let rec = match opcode {
            op::MD_AUDIO => SubRecord::Audio(AudioData {
                title: r.string("audio title")?,
                artist: r.string("audio artist")?,
                album: r.string("audio album")?,
                bitrate: r.u32("audio bitrate")?,
                length_secs: r.u32("audio length")?,
            }),
            op::MD_VIDEO => SubRecord::Video(VideoData {
                codec: r.string("video codec")?,
                bitrate: r.u32("video bitrate")?,
                length_secs: r.u32("video length")?,
                width: r.u32("video width")?,
                height: r.u32("video height")?,
            }),
            op::MD_IMAGE => SubRecord::Image(ImageData {
                width: r.u32("image width")?,
                height: r.u32("image height")?,
            }),
            op::MD_ARCHIVE => SubRecord::Archive(ArchiveData {
                file_count: r.u32("archive files")?,
                uncompressed: r.u64("archive size")?,
            }),
            op::MD_STREAM => SubRecord::Stream(StreamData {
                codec: r.string("stream codec")?,
                bitrate: r.u32("stream bitrate")?,
                length_secs: r.u32("stream length")?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(rec))
    }
}

// ── MetaData ─────────────────────────────────────────────────────

/// A known file name with its use count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub name: String,
    pub uses: u32,
}

/// Per-file metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData {
    size: u64,
    /// Last known modification date, seconds since the epoch.
    mod_date: u32,
    names: Vec<FileName>,
    hash_sets: Vec<HashSet>,
    custom: Vec<SubRecord>,
}

impl MetaData {
    pub fn new(size: u64, mod_date: u32) -> Self {
        Self { size, mod_date, ..Default::default() }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mod_date(&self) -> u32 {
        self.mod_date
    }

    pub fn set_mod_date(&mut self, date: u32) {
        self.mod_date = date;
    }

    /// First known name, if any.
    pub fn name(&self) -> Option<&str> {
        self.names.first().map(|n| n.name.as_str())
    }

    pub fn names(&self) -> &[FileName] {
        &self.names
    }

    /// Add a name, or bump its use count when already known.
    pub fn add_name(&mut self, name: &str) {
        if let Some(existing) = self.names.iter_mut().find(|n| n.name == name) {
            existing.uses += 1;
            return;
        }
        self.names.push(FileName { name: name.to_string(), uses: 1 });
    }

    /// Drop one use of a name; the name is retired at zero.
    /// Returns true when the name was removed entirely.
    pub fn release_name(&mut self, name: &str) -> bool {
        if let Some(idx) = self.names.iter().position(|n| n.name == name) {
            let entry = &mut self.names[idx];
            entry.uses = entry.uses.saturating_sub(1);
            if entry.uses == 0 {
                self.names.remove(idx);
                return true;
            }
        }
        false
    }

    pub fn hash_sets(&self) -> &[HashSet] {
        &self.hash_sets
    }

    /// Hashset of a given file-hash algorithm, if known.
    pub fn hash_set(&self, algo: HashAlgo) -> Option<&HashSet> {
        self.hash_sets.iter().find(|hs| hs.file_algo() == algo)
    }

    /// File hashes across all hashsets; these define content identity.
    pub fn file_hashes(&self) -> impl Iterator<Item = &HashValue> {
        self.hash_sets.iter().map(|hs| hs.file_hash()).filter(|h| !h.is_empty())
    }

    /// Add a hashset. A set whose algorithm pair and chunk size are
    /// already present is dropped (hashsets are never mutated in
    /// place).
    pub fn add_hash_set(&mut self, hs: HashSet) {
        if self.hash_sets.iter().any(|have| have.compatible_with(&hs)) {
            return;
        }
        self.hash_sets.push(hs);
    }

    pub fn custom(&self) -> &[SubRecord] {
        &self.custom
    }

    /// Attach a sub-record; one per family, first writer wins.
    pub fn add_custom(&mut self, rec: SubRecord) {
        let tag = rec.opcode();
        if self.custom.iter().any(|have| have.opcode() == tag) {
            return;
        }
        self.custom.push(rec);
    }

    /// Fold another record for the same content into this one.
    pub fn merge(&mut self, other: MetaData) {
        if self.size == 0 {
            self.size = other.size;
        }
        if other.mod_date > self.mod_date {
            self.mod_date = other.mod_date;
        }
        for name in other.names {
            if let Some(existing) = self.names.iter_mut().find(|n| n.name == name.name) {
                existing.uses += name.uses;
            } else {
                self.names.push(name);
            }
        }
        for hs in other.hash_sets {
            self.add_hash_set(hs);
        }
        for rec in other.custom {
            self.add_custom(rec);
        }
    }

    // ── Persisted form (length-prefixed record) ──────────────────
    //
    // `u8 OP_METADATA | u16 len | u64 size | u32 modDate |
    //  u16 nameCount | <name, u32 uses>* | u16 hashsetCount |
    //  <hashsets> | u16 customCount | <custom tags>`

    pub fn encode(&self, w: &mut Writer) {
        let mut p = Writer::new();
        p.u64(self.size);
        p.u32(self.mod_date);

        p.u16(self.names.len().min(u16::MAX as usize) as u16);
        for n in &self.names {
            p.string(&n.name);
            p.u32(n.uses);
        }

        p.u16(self.hash_sets.len().min(u16::MAX as usize) as u16);
        for hs in &self.hash_sets {
            hs.encode(&mut p);
        }

        p.u16(self.custom.len().min(u16::MAX as usize) as u16);
        for rec in &self.custom {
            rec.encode(&mut p);
        }

        w.tag(op::METADATA, p.as_slice());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let mut p = r.expect_tag(op::METADATA, "metadata record")?;

        let mut md = MetaData::new(p.u64("metadata size")?, p.u32("metadata mod date")?);

        let name_count = p.u16("metadata name count")?;
        for _ in 0..name_count {
            let name = p.string("metadata name")?;
            let uses = p.u32("metadata name uses")?;
            md.names.push(FileName { name, uses: uses.max(1) });
        }

        let hs_count = p.u16("metadata hashset count")?;
        for _ in 0..hs_count {
            md.hash_sets.push(HashSet::decode(&mut p)?);
        }

        let custom_count = p.u16("metadata custom count")?;
        for _ in 0..custom_count {
            let (opcode, mut body) = p.tag("metadata custom record")?;
            if let Some(rec) = SubRecord::decode(opcode, &mut body)? {
                md.custom.push(rec);
            }
        }

        Ok(md)
    }
}
