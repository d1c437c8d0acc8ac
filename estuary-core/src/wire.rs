//! Little-endian stream primitives for the persisted and wire formats.
//!
//! Every on-disk and on-wire structure in this crate (partial-file
//! sidecars, the metadata database, the credit store, hashset and range
//! encodings) is an explicit byte layout written through [`Writer`] and
//! parsed back through [`Reader`]. Compound values use the tag form
//! `u8 opcode | u16 len | payload`, which lets a parser skip opcodes it
//! does not understand.
//!
//! Truncated or malformed input surfaces as [`CoreError::Stream`], never
//! a panic.

use bytes::{BufMut, BytesMut};

use crate::error::CoreError;

/// Opcodes used by the tagged encodings.
pub mod op {
    /// A single `[begin, end]` range.
    pub const RANGE: u8 = 0x10;
    /// A list of ranges, prefixed with a `u32` count.
    pub const RANGE_LIST: u8 = 0x11;
    /// A bare hash value (`u8` algorithm + digest).
    pub const HASH: u8 = 0x20;
    /// A hashset (file hash + chunk hashes + chunk size).
    pub const HASHSET: u8 = 0x21;
    /// Metadata record.
    pub const METADATA: u8 = 0x30;

    /// Hashset-internal tags.
    pub const HS_FILEHASH: u8 = 0x01;
    pub const HS_PARTHASH: u8 = 0x02;
    pub const HS_PARTSIZE: u8 = 0x03;

    /// Typed metadata sub-records.
    pub const MD_AUDIO: u8 = 0x31;
    pub const MD_VIDEO: u8 = 0x32;
    pub const MD_IMAGE: u8 = 0x33;
    pub const MD_ARCHIVE: u8 = 0x34;
    pub const MD_STREAM: u8 = 0x35;
}

// ── Reader ───────────────────────────────────────────────────────

/// Bounds-checked little-endian reader over a byte slice.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left unread.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CoreError> {
        if self.buf.len() < n {
            return Err(CoreError::Stream(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, CoreError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, CoreError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, CoreError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, CoreError> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read exactly `n` raw bytes.
    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CoreError> {
        self.take(n, what)
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self, what: &'static str) -> Result<String, CoreError> {
        let len = self.u16(what)? as usize;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CoreError::Stream(what))
    }

    /// Read a tag header, returning `(opcode, payload reader)`. The
    /// payload is consumed from this reader regardless of whether the
    /// caller understands the opcode.
    pub fn tag(&mut self, what: &'static str) -> Result<(u8, Reader<'a>), CoreError> {
        let opcode = self.u8(what)?;
        let len = self.u16(what)? as usize;
        let payload = self.take(len, what)?;
        Ok((opcode, Reader::new(payload)))
    }

    /// Read a tag header and require a specific opcode.
    pub fn expect_tag(&mut self, opcode: u8, what: &'static str) -> Result<Reader<'a>, CoreError> {
        let (found, payload) = self.tag(what)?;
        if found != opcode {
            return Err(CoreError::UnknownVariant { what, value: found as u64 });
        }
        Ok(payload)
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Little-endian writer accumulating into a [`BytesMut`].
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Write a `u16`-length-prefixed UTF-8 string. Oversized strings
    /// are truncated at the `u16` boundary; real file names never get
    /// close.
    pub fn string(&mut self, v: &str) -> &mut Self {
        let raw = v.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.buf.put_u16_le(len as u16);
        self.buf.put_slice(&raw[..len]);
        self
    }

    /// Write `u8 opcode | u16 len | payload`.
    pub fn tag(&mut self, opcode: u8, payload: &[u8]) -> &mut Self {
        self.buf.put_u8(opcode);
        self.buf.put_u16_le(payload.len().min(u16::MAX as usize) as u16);
        self.buf.put_slice(&payload[..payload.len().min(u16::MAX as usize)]);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut w = Writer::new();
        w.u8(0xE0).u16(0x1234).u32(0xDEADBEEF).u64(9_728_000);
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8("v").unwrap(), 0xE0);
        assert_eq!(r.u16("v").unwrap(), 0x1234);
        assert_eq!(r.u32("v").unwrap(), 0xDEADBEEF);
        assert_eq!(r.u64("v").unwrap(), 9_728_000);
        assert!(r.is_empty());
    }

    #[test]
    fn string_roundtrip() {
        let mut w = Writer::new();
        w.string("movie.mkv");
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.string("name").unwrap(), "movie.mkv");
    }

    #[test]
    fn truncated_input_is_stream_error() {
        let mut r = Reader::new(&[0x01, 0x02]);
        let err = r.u32("field").unwrap_err();
        assert!(matches!(err, CoreError::Stream("field")));
    }

    #[test]
    fn tag_skips_unknown_payload() {
        let mut w = Writer::new();
        w.tag(0x7F, &[1, 2, 3]);
        w.u8(0x42);
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        let (opcode, payload) = r.tag("tag").unwrap();
        assert_eq!(opcode, 0x7F);
        assert_eq!(payload.remaining(), 3);
        // Unknown payload was consumed; the stream continues cleanly.
        assert_eq!(r.u8("next").unwrap(), 0x42);
    }

    #[test]
    fn expect_tag_rejects_wrong_opcode() {
        let mut w = Writer::new();
        w.tag(op::RANGE, &[0; 16]);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert!(r.expect_tag(op::HASHSET, "hashset").is_err());
    }
}
