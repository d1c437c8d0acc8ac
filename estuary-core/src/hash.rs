//! Hash value types.
//!
//! A [`HashValue`] is an immutable fixed-width byte string tagged by the
//! algorithm that produced it. Values are cheap to copy, compare equal
//! and ordered, and carry a distinguished empty state so "no hash known
//! yet" never needs an `Option` on the wire.

use std::fmt;

use crate::error::CoreError;
use crate::wire::{op, Reader, Writer};

/// Largest digest carried by any supported algorithm (SHA-1).
const MAX_DIGEST: usize = 20;

/// Hash algorithm identifiers, with their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HashAlgo {
    Md4 = 0x01,
    Md5 = 0x02,
    Sha1 = 0x03,
    /// Hash-of-MD4s over 9 728 000-byte parts.
    Ed2k = 0x04,
}

impl HashAlgo {
    /// Digest width in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Md4 | HashAlgo::Md5 | HashAlgo::Ed2k => 16,
            HashAlgo::Sha1 => 20,
        }
    }

    pub fn from_wire(id: u8) -> Result<Self, CoreError> {
        match id {
            0x01 => Ok(HashAlgo::Md4),
            0x02 => Ok(HashAlgo::Md5),
            0x03 => Ok(HashAlgo::Sha1),
            0x04 => Ok(HashAlgo::Ed2k),
            other => Err(CoreError::UnknownVariant { what: "hash algorithm", value: other as u64 }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Md4 => "md4",
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Ed2k => "ed2k",
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── HashValue ────────────────────────────────────────────────────

/// An algorithm-tagged digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashValue {
    algo: HashAlgo,
    /// Digest bytes, zero-padded past `algo.digest_len()`.
    bytes: [u8; MAX_DIGEST],
    /// False for the distinguished empty state.
    set: bool,
}

impl HashValue {
    /// Wrap a computed digest. The slice length must match the
    /// algorithm's digest width.
    pub fn new(algo: HashAlgo, digest: &[u8]) -> Result<Self, CoreError> {
        if digest.len() != algo.digest_len() {
            return Err(CoreError::Stream("hash digest length"));
        }
        let mut bytes = [0u8; MAX_DIGEST];
        bytes[..digest.len()].copy_from_slice(digest);
        Ok(Self { algo, bytes, set: true })
    }

    /// The empty (null) value for an algorithm.
    pub fn empty(algo: HashAlgo) -> Self {
        Self { algo, bytes: [0u8; MAX_DIGEST], set: false }
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn is_empty(&self) -> bool {
        !self.set
    }

    /// Digest bytes; empty slice for the empty state.
    pub fn digest(&self) -> &[u8] {
        if self.set {
            &self.bytes[..self.algo.digest_len()]
        } else {
            &[]
        }
    }

    // ── Wire form: `u8 OP_HASH | u16 len | u8 algo | digest` ─────

    pub fn encode(&self, w: &mut Writer) {
        let mut payload = Writer::new();
        payload.u8(self.algo as u8);
        payload.bytes(self.digest());
        w.tag(op::HASH, payload.as_slice());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let mut payload = r.expect_tag(op::HASH, "hash tag")?;
        Self::decode_payload(&mut payload)
    }

    /// Decode the `u8 algo | digest` body without the tag header.
    pub fn decode_payload(r: &mut Reader<'_>) -> Result<Self, CoreError> {
        let algo = HashAlgo::from_wire(r.u8("hash algorithm")?)?;
        if r.remaining() == 0 {
            return Ok(Self::empty(algo));
        }
        let digest = r.bytes(algo.digest_len(), "hash digest")?;
        Self::new(algo, digest)
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.set {
            return write!(f, "{}:<empty>", self.algo);
        }
        write!(f, "{}:", self.algo)?;
        for b in self.digest() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
