//! File hash plus ordered chunk hashes over a fixed chunk size.
//!
//! A [`HashSet`] identifies a file in one hash-algorithm family and
//! carries the per-chunk reference hashes that let ranges of the file be
//! verified independently. The ED2K flavour (ED2K file hash over MD4
//! part hashes, 9 728 000-byte parts) is the one several wire protocols
//! inherit.

use crate::error::CoreError;
use crate::hash::{HashAlgo, HashValue};
use crate::wire::{op, Reader, Writer};

/// ED2K part size in bytes.
pub const ED2K_PART_SIZE: u64 = 9_728_000;

/// A file hash with its chunk-hash sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSet {
    file_algo: HashAlgo,
    chunk_algo: HashAlgo,
    /// Chunk grid unit; 0 when the set carries only a file hash.
    chunk_size: u64,
    file_hash: HashValue,
    chunk_hashes: Vec<HashValue>,
}

impl HashSet {
    pub fn new(file_algo: HashAlgo, chunk_algo: HashAlgo, chunk_size: u64) -> Self {
        Self {
            file_algo,
            chunk_algo,
            chunk_size,
            file_hash: HashValue::empty(file_algo),
            chunk_hashes: Vec::new(),
        }
    }

    /// A set carrying only a whole-file hash (no chunk grid).
    pub fn file_only(file_hash: HashValue) -> Self {
        Self {
            file_algo: file_hash.algo(),
            chunk_algo: file_hash.algo(),
            chunk_size: 0,
            file_hash,
            chunk_hashes: Vec::new(),
        }
    }

    /// The ED2K flavour: ED2K file hash over MD4 part hashes.
    pub fn ed2k() -> Self {
        Self::new(HashAlgo::Ed2k, HashAlgo::Md4, ED2K_PART_SIZE)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn file_algo(&self) -> HashAlgo {
        self.file_algo
    }

    pub fn chunk_algo(&self) -> HashAlgo {
        self.chunk_algo
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn file_hash(&self) -> &HashValue {
        &self.file_hash
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn chunk_hash(&self, idx: usize) -> Option<&HashValue> {
        self.chunk_hashes.get(idx)
    }

    pub fn chunk_hashes(&self) -> &[HashValue] {
        &self.chunk_hashes
    }

    /// True when this set can seed a verifying chunk grid.
    pub fn has_chunks(&self) -> bool {
        self.chunk_size > 0 && !self.chunk_hashes.is_empty()
    }

    // ── Mutators (additive only) ─────────────────────────────────

    pub fn set_file_hash(&mut self, hash: HashValue) -> Result<(), CoreError> {
        if hash.algo() != self.file_algo {
            return Err(CoreError::Stream("file hash algorithm"));
        }
        self.file_hash = hash;
        Ok(())
    }

    pub fn add_chunk_hash(&mut self, hash: HashValue) -> Result<(), CoreError> {
        if hash.algo() != self.chunk_algo {
            return Err(CoreError::Stream("chunk hash algorithm"));
        }
        self.chunk_hashes.push(hash);
        Ok(())
    }

    /// Same algorithm family and chunk size; such sets describe the
    /// same grid and their chunk hashes are comparable one-to-one.
    pub fn compatible_with(&self, other: &HashSet) -> bool {
        self.file_algo == other.file_algo
            && self.chunk_algo == other.chunk_algo
            && self.chunk_size == other.chunk_size
    }

    // ── Wire form ────────────────────────────────────────────────
    //
    // `u8 OP_HASHSET | u16 len | u8 chunkAlgo | u8 fileAlgo |
    //  u16 tagCount | <tags>` with FILEHASH / PARTHASH / PARTSIZE tags.

    pub fn encode(&self, w: &mut Writer) {
        let mut payload = Writer::new();
        payload.u8(self.chunk_algo as u8);
        payload.u8(self.file_algo as u8);

        let tag_count = 1 + self.chunk_hashes.len() + usize::from(self.chunk_size > 0);
        payload.u16(tag_count.min(u16::MAX as usize) as u16);

        payload.tag(op::HS_FILEHASH, self.file_hash.digest());
        for chunk in &self.chunk_hashes {
            payload.tag(op::HS_PARTHASH, chunk.digest());
        }
        if self.chunk_size > 0 {
            let mut size = Writer::new();
            size.u64(self.chunk_size);
            payload.tag(op::HS_PARTSIZE, size.as_slice());
        }

        w.tag(op::HASHSET, payload.as_slice());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let mut payload = r.expect_tag(op::HASHSET, "hashset tag")?;

        let chunk_algo = HashAlgo::from_wire(payload.u8("chunk algorithm")?)?;
        let file_algo = HashAlgo::from_wire(payload.u8("file algorithm")?)?;
        let tag_count = payload.u16("hashset tag count")?;

        let mut set = HashSet::new(file_algo, chunk_algo, 0);
        for _ in 0..tag_count {
            let (opcode, mut body) = payload.tag("hashset tag")?;
            match opcode {
                op::HS_FILEHASH => {
                    let digest = body.bytes(file_algo.digest_len(), "file hash")?;
                    set.file_hash = HashValue::new(file_algo, digest)?;
                }
                op::HS_PARTHASH => {
                    let digest = body.bytes(chunk_algo.digest_len(), "part hash")?;
                    set.chunk_hashes.push(HashValue::new(chunk_algo, digest)?);
                }
                op::HS_PARTSIZE => {
                    set.chunk_size = body.u64("part size")?;
                }
                // Unknown tags were length-skipped by `tag()`.
                _ => {}
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md4(b: u8) -> HashValue {
        HashValue::new(HashAlgo::Md4, &[b; 16]).unwrap()
    }

    #[test]
    fn ed2k_parameters() {
        let hs = HashSet::ed2k();
        assert_eq!(hs.file_algo(), HashAlgo::Ed2k);
        assert_eq!(hs.chunk_algo(), HashAlgo::Md4);
        assert_eq!(hs.chunk_size(), 9_728_000);
    }

    #[test]
    fn algorithm_mismatch_rejected() {
        let mut hs = HashSet::ed2k();
        let sha = HashValue::new(HashAlgo::Sha1, &[0; 20]).unwrap();
        assert!(hs.add_chunk_hash(sha).is_err());
        assert!(hs.set_file_hash(md4(1)).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let mut hs = HashSet::ed2k();
        hs.set_file_hash(HashValue::new(HashAlgo::Ed2k, &[0xCD; 16]).unwrap()).unwrap();
        hs.add_chunk_hash(md4(0x11)).unwrap();
        hs.add_chunk_hash(md4(0x22)).unwrap();

        let mut w = Writer::new();
        hs.encode(&mut w);
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        let back = HashSet::decode(&mut r).unwrap();
        assert_eq!(back, hs);
        assert!(r.is_empty());
    }

    #[test]
    fn file_only_set_roundtrip() {
        let hs = HashSet::file_only(HashValue::new(HashAlgo::Sha1, &[9; 20]).unwrap());
        assert!(!hs.has_chunks());

        let mut w = Writer::new();
        hs.encode(&mut w);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        let back = HashSet::decode(&mut r).unwrap();
        assert_eq!(back.chunk_count(), 0);
        assert_eq!(back.file_hash(), hs.file_hash());
    }

    #[test]
    fn compatibility() {
        assert!(HashSet::ed2k().compatible_with(&HashSet::ed2k()));
        let other = HashSet::new(HashAlgo::Sha1, HashAlgo::Sha1, 262_144);
        assert!(!HashSet::ed2k().compatible_with(&other));
    }
}
