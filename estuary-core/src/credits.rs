//! Per-peer credit accounting and slot signatures.
//!
//! Credits reward peers that gave us data: the derived score in
//! `[1.0, 10.0]` feeds the upload queue ordering. Entries are keyed by
//! the peer's public key; the user hash is a weaker fallback (hashes
//! can be stolen, keys cannot).
//!
//! The store persists in the `clients.met` layout: version `0x12`
//! includes the RSA public key per record, legacy `0x11` does not.
//! Entries idle for more than five months are pruned at load time.

use std::collections::HashMap;
use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey,
    EncodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::wire::{Reader, Writer};

/// Current `clients.met` version: records carry a public key.
const MET_VERSION: u8 = 0x12;
/// Legacy version without keys.
const MET_VERSION_LEGACY: u8 = 0x11;

/// Key field width on disk (zero-padded).
const MET_KEY_SIZE: usize = 80;

/// Entries unseen for this long are dropped at load.
const PRUNE_AFTER_SECS: u32 = 5 * 30 * 24 * 3600;

/// Default keypair strength.
const RSA_BITS: usize = 384;

/// One peer's credit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credits {
    user_hash: [u8; 16],
    uploaded: u64,
    downloaded: u64,
    /// Unix seconds of the last handshake.
    last_seen: u32,
    /// DER public key; empty when the peer never proved one.
    public_key: Vec<u8>,
}

impl Credits {
    fn new(public_key: Vec<u8>, user_hash: [u8; 16]) -> Self {
        Self { user_hash, uploaded: 0, downloaded: 0, last_seen: 0, public_key }
    }

    /// Queue score in `[1.0, 10.0]`.
    ///
    /// Below 1 MiB received the peer has earned nothing yet. Otherwise
    /// twice the download/upload ratio, capped by `sqrt(down_MiB + 2)`
    /// and clamped; an untouched upload side counts as the upper
    /// clamp.
    pub fn score(&self) -> f32 {
        if self.downloaded < 1024 * 1024 {
            return 1.0;
        }
        let ratio = if self.uploaded == 0 {
            10.0
        } else {
            self.downloaded as f32 * 2.0 / self.uploaded as f32
        };
        let cap = (self.downloaded as f32 / (1024.0 * 1024.0) + 2.0).sqrt();
        ratio.min(cap).clamp(1.0, 10.0)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    pub fn user_hash(&self) -> &[u8; 16] {
        &self.user_hash
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Count a chunk delivered to this peer.
    pub fn add_uploaded(&mut self, amount: u64) {
        self.uploaded += amount;
    }

    /// Count a chunk received from this peer.
    pub fn add_downloaded(&mut self, amount: u64) {
        self.downloaded += amount;
    }

    /// Unix seconds, updated on any handshake.
    pub fn set_last_seen(&mut self, when: u32) {
        self.last_seen = when;
    }
}

// ── CreditStore ──────────────────────────────────────────────────

/// The persisted credit database.
#[derive(Default)]
pub struct CreditStore {
    entries: Vec<Credits>,
    by_key: HashMap<Vec<u8>, usize>,
    by_hash: HashMap<[u8; 16], usize>,
}

impl CreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up by public key.
    pub fn find(&self, public_key: &[u8]) -> Option<&Credits> {
        self.by_key.get(public_key).map(|&i| &self.entries[i])
    }

    pub fn find_mut(&mut self, public_key: &[u8]) -> Option<&mut Credits> {
        self.by_key.get(public_key).map(|&i| &mut self.entries[i])
    }

    /// Weaker fallback lookup by user hash.
    pub fn find_by_hash(&self, user_hash: &[u8; 16]) -> Option<&Credits> {
        self.by_hash.get(user_hash).map(|&i| &self.entries[i])
    }

    pub fn find_by_hash_mut(&mut self, user_hash: &[u8; 16]) -> Option<&mut Credits> {
        self.by_hash.get(user_hash).map(|&i| &mut self.entries[i])
    }

    /// Fetch or create the record for a peer.
    pub fn create(&mut self, public_key: Vec<u8>, user_hash: [u8; 16]) -> &mut Credits {
        if let Some(&i) = self.by_key.get(&public_key) {
            return &mut self.entries[i];
        }
        let idx = self.entries.len();
        self.entries.push(Credits::new(public_key.clone(), user_hash));
        if !public_key.is_empty() {
            self.by_key.insert(public_key, idx);
        }
        self.by_hash.insert(user_hash, idx);
        &mut self.entries[idx]
    }

    /// Queue score for a peer, 1.0 when unknown.
    pub fn score_of(&self, public_key: &[u8]) -> f32 {
        self.find(public_key).map(Credits::score).unwrap_or(1.0)
    }

    // ── Persistence ──────────────────────────────────────────────

    pub fn save(&self, w: &mut Writer) {
        w.u8(MET_VERSION);
        w.u32(self.entries.len() as u32);
        for c in &self.entries {
            w.bytes(&c.user_hash);
            w.u32(c.uploaded as u32);
            w.u32(c.downloaded as u32);
            w.u32(c.last_seen);
            w.u32((c.uploaded >> 32) as u32);
            w.u32((c.downloaded >> 32) as u32);
            w.u16(0); // reserved
            let mut key = [0u8; MET_KEY_SIZE];
            let len = c.public_key.len().min(MET_KEY_SIZE);
            key[..len].copy_from_slice(&c.public_key[..len]);
            w.u8(len as u8);
            w.bytes(&key);
        }
    }

    /// Load records, pruning entries idle since `now - 5 months`.
    pub fn load(&mut self, r: &mut Reader<'_>, now: u32) -> Result<usize, CoreError> {
        let version = r.u8("credits version")?;
        if version != MET_VERSION && version != MET_VERSION_LEGACY {
            return Err(CoreError::UnknownVariant {
                what: "credits version",
                value: version as u64,
            });
        }
        let count = r.u32("credits count")?;
        let cutoff = now.saturating_sub(PRUNE_AFTER_SECS);
        let mut added = 0usize;
        let mut pruned = 0usize;
        for _ in 0..count {
            let mut user_hash = [0u8; 16];
            user_hash.copy_from_slice(r.bytes(16, "credits user hash")?);
            let up_low = r.u32("credits upload low")?;
            let down_low = r.u32("credits download low")?;
            let last_seen = r.u32("credits last seen")?;
            let up_high = r.u32("credits upload high")?;
            let down_high = r.u32("credits download high")?;
            let _reserved = r.u16("credits reserved")?;
            let public_key = if version == MET_VERSION {
                let key_len = r.u8("credits key size")? as usize;
                let raw = r.bytes(MET_KEY_SIZE, "credits key")?;
                raw[..key_len.min(MET_KEY_SIZE)].to_vec()
            } else {
                Vec::new()
            };

            if last_seen < cutoff {
                pruned += 1;
                continue;
            }

            let entry = self.create(public_key, user_hash);
            entry.uploaded = (up_high as u64) << 32 | up_low as u64;
            entry.downloaded = (down_high as u64) << 32 | down_low as u64;
            entry.last_seen = last_seen;
            added += 1;
        }
        debug!(target: "estuary::credits", added, pruned, "credit store loaded");
        Ok(added)
    }

    pub fn save_file(&self, path: &Path) -> Result<(), CoreError> {
        let mut w = Writer::new();
        self.save(&mut w);
        std::fs::write(path, w.as_slice())?;
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path, now: u32) -> usize {
        let Ok(raw) = std::fs::read(path) else { return 0 };
        match self.load(&mut Reader::new(&raw), now) {
            Ok(added) => added,
            Err(err) => {
                warn!(target: "estuary::credits", %err, "corrupt credit store");
                0
            }
        }
    }
}

// ── Slot signatures ──────────────────────────────────────────────

/// Our RSA identity for the credit challenge exchange.
pub struct CreditCrypto {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

/// Optional address binding inside a signed challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBinding {
    pub ip_type: u8,
    pub ip: u32,
}

impl CreditCrypto {
    /// Load the keypair, generating and persisting one on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, CoreError> {
        if let Ok(der) = std::fs::read(path) {
            if let Ok(private) = RsaPrivateKey::from_pkcs1_der(&der) {
                return Ok(Self::from_private(private));
            }
            warn!(target: "estuary::credits", "unreadable crypt key; generating a new one");
        }
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| CoreError::Other(format!("keygen failed: {e}")))?;
        let der = private
            .to_pkcs1_der()
            .map_err(|e| CoreError::Other(format!("key encode failed: {e}")))?;
        std::fs::write(path, der.as_bytes())?;
        info!(target: "estuary::credits", "created new credit keypair");
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public_der = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .expect("public key encodes")
            .into_vec();
        Self { private, public_der }
    }

    /// Our advertised public key (PKCS#1 DER).
    pub fn public_key(&self) -> &[u8] {
        &self.public_der
    }

    /// Sign `(remote_public_key || challenge || [ip_type || ip])` for
    /// the peer that issued `challenge`.
    pub fn create_signature(
        &self,
        remote_key: &[u8],
        challenge: u32,
        binding: Option<IpBinding>,
    ) -> Result<Vec<u8>, CoreError> {
        let digest = challenge_digest(remote_key, challenge, binding);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| CoreError::Other(format!("signing failed: {e}")))
    }

    /// Verify a peer's answer to our `challenge` against its
    /// advertised public key.
    pub fn verify_signature(
        own_key: &[u8],
        peer_key: &[u8],
        challenge: u32,
        signature: &[u8],
        binding: Option<IpBinding>,
    ) -> bool {
        let Ok(public) = RsaPublicKey::from_pkcs1_der(peer_key) else {
            return false;
        };
        let digest = challenge_digest(own_key, challenge, binding);
        public.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature).is_ok()
    }
}

fn challenge_digest(key: &[u8], challenge: u32, binding: Option<IpBinding>) -> Vec<u8> {
    let mut h = Sha1::new();
    h.update(key);
    h.update(challenge.to_le_bytes());
    if let Some(b) = binding {
        h.update(b.ip.to_le_bytes());
        h.update([b.ip_type]);
    }
    h.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn entry(up: u64, down: u64) -> Credits {
        let mut c = Credits::new(vec![1, 2, 3], [0u8; 16]);
        c.add_uploaded(up);
        c.add_downloaded(down);
        c
    }

    #[test]
    fn score_is_one_below_one_mib() {
        assert_eq!(entry(0, 0).score(), 1.0);
        assert_eq!(entry(0, MIB - 1).score(), 1.0);
        assert_eq!(entry(50 * MIB, MIB - 1).score(), 1.0);
    }

    #[test]
    fn score_ratio_with_sqrt_cap() {
        // 4 MiB down, 1 MiB up: ratio 8, cap sqrt(6) ~ 2.45.
        let score = entry(MIB, 4 * MIB).score();
        assert!((score - (6.0f32).sqrt()).abs() < 0.01, "score = {score}");

        // 2 MiB down, 4 MiB up: ratio 1.0, below cap, clamps at 1.
        let score = entry(4 * MIB, 2 * MIB).score();
        assert_eq!(score, 1.0);
    }

    #[test]
    fn zero_upload_takes_upper_clamp() {
        // Nothing sent: ratio counts as 10, cap still applies.
        let score = entry(0, 2 * MIB).score();
        assert!((score - 2.0).abs() < 0.01);

        // Enough downloaded that the cap exceeds 10: full clamp.
        let score = entry(0, 200 * MIB).score();
        assert_eq!(score, 10.0);
    }

    #[test]
    fn score_bounds_hold() {
        for (up, down) in [(0, 0), (1, MIB), (MIB, 1000 * MIB), (1000 * MIB, MIB)] {
            let s = entry(up, down).score();
            assert!((1.0..=10.0).contains(&s), "score {s} for {up}/{down}");
        }
    }

    #[test]
    fn monotonic_counters() {
        let mut c = entry(0, 0);
        c.add_uploaded(100);
        c.add_uploaded(50);
        c.add_downloaded(10);
        assert_eq!(c.uploaded(), 150);
        assert_eq!(c.downloaded(), 10);
    }

    #[test]
    fn store_roundtrip() {
        let mut store = CreditStore::new();
        let c = store.create(vec![0xAA; 76], [1u8; 16]);
        c.add_uploaded(5_000_000_000); // past 32 bits
        c.add_downloaded(123);
        c.set_last_seen(1_700_000_000);

        let mut w = Writer::new();
        store.save(&mut w);
        let bytes = w.into_vec();

        let mut fresh = CreditStore::new();
        let added = fresh.load(&mut Reader::new(&bytes), 1_700_000_100).unwrap();
        assert_eq!(added, 1);
        let back = fresh.find(&vec![0xAA; 76][..]).unwrap();
        assert_eq!(back.uploaded(), 5_000_000_000);
        assert_eq!(back.downloaded(), 123);
        assert_eq!(back.last_seen(), 1_700_000_000);
        assert_eq!(back.user_hash(), &[1u8; 16]);
    }

    #[test]
    fn idle_entries_pruned_at_load() {
        let mut store = CreditStore::new();
        store.create(vec![1], [1u8; 16]).set_last_seen(1_000_000);
        store.create(vec![2], [2u8; 16]).set_last_seen(999_000_000);

        let mut w = Writer::new();
        store.save(&mut w);
        let bytes = w.into_vec();

        let mut fresh = CreditStore::new();
        let added = fresh.load(&mut Reader::new(&bytes), 1_000_000_000).unwrap();
        assert_eq!(added, 1);
        assert!(fresh.find(&[1][..]).is_none());
        assert!(fresh.find(&[2][..]).is_some());
    }

    #[test]
    fn hash_fallback_lookup() {
        let mut store = CreditStore::new();
        store.create(vec![9; 40], [7u8; 16]);
        assert!(store.find_by_hash(&[7u8; 16]).is_some());
        assert!(store.find_by_hash(&[8u8; 16]).is_none());
    }

    #[test]
    fn signature_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let us = CreditCrypto::load_or_create(&dir.path().join("cryptkey.dat")).unwrap();
        let them = CreditCrypto::load_or_create(&dir.path().join("peer.dat")).unwrap();

        // They sign our challenge over our key; we verify with theirs.
        let challenge = 0xDEAD_BEEF;
        let sig = them.create_signature(us.public_key(), challenge, None).unwrap();
        assert!(CreditCrypto::verify_signature(
            us.public_key(),
            them.public_key(),
            challenge,
            &sig,
            None
        ));

        // Wrong challenge fails.
        assert!(!CreditCrypto::verify_signature(
            us.public_key(),
            them.public_key(),
            challenge + 1,
            &sig,
            None
        ));

        // Binding must match.
        let bound = IpBinding { ip_type: 20, ip: 0x0100_007F };
        let sig = them.create_signature(us.public_key(), challenge, Some(bound)).unwrap();
        assert!(CreditCrypto::verify_signature(
            us.public_key(),
            them.public_key(),
            challenge,
            &sig,
            Some(bound)
        ));
        assert!(!CreditCrypto::verify_signature(
            us.public_key(),
            them.public_key(),
            challenge,
            &sig,
            None
        ));
    }

    #[test]
    fn keypair_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cryptkey.dat");
        let first = CreditCrypto::load_or_create(&path).unwrap();
        let second = CreditCrypto::load_or_create(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
