//! Hash jobs and streaming digests.
//!
//! A [`HashWork`] describes either a full-file hash (producing a fresh
//! [`MetaData`] with one hashset per algorithm) or a range verification
//! against a reference hash. Jobs are queued to the I/O worker thread
//! and processed with a fixed read buffer feeding every active digest;
//! completion is posted back to the main loop as an event carrying the
//! job itself.
//!
//! Cancellation is cooperative: the originator flips the job's validity
//! flag and the worker polls it between buffers, discarding invalidated
//! jobs without posting a completion.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use md4::{Digest, Md4};
use md5::Md5;
use sha1::Sha1;
use tokio_util::sync::CancellationToken;

use crate::hash::{HashAlgo, HashValue};
use crate::hashset::{HashSet, ED2K_PART_SIZE};
use crate::metadata::MetaData;
use crate::part::PartId;

/// Read buffer used by the worker.
pub const HASH_BUF_SIZE: usize = 32 * 1024;

// ── Global throughput counters ───────────────────────────────────

struct HashStats {
    bytes: u64,
    seconds: f64,
}

static STATS: Mutex<HashStats> = Mutex::new(HashStats { bytes: 0, seconds: 0.0 });

/// Total bytes fed through digests since startup.
pub fn hashed_bytes() -> u64 {
    STATS.lock().expect("hash stats lock").bytes
}

/// Total wall-clock time spent hashing since startup.
pub fn hash_time() -> Duration {
    Duration::from_secs_f64(STATS.lock().expect("hash stats lock").seconds)
}

fn record_stats(bytes: u64, elapsed: Duration) {
    let mut stats = STATS.lock().expect("hash stats lock");
    stats.bytes += bytes;
    stats.seconds += elapsed.as_secs_f64();
}

// ── Streaming digests ────────────────────────────────────────────

/// ED2K hashset builder: MD4 per 9 728 000-byte part, file hash over
/// the concatenated part digests.
struct Ed2kMaker {
    md4: Md4,
    part_bytes: u64,
    chunks: Vec<HashValue>,
}

impl Ed2kMaker {
    fn new() -> Self {
        Self { md4: Md4::new(), part_bytes: 0, chunks: Vec::new() }
    }

    fn update(&mut self, mut data: &[u8]) {
        while self.part_bytes + data.len() as u64 >= ED2K_PART_SIZE {
            let take = (ED2K_PART_SIZE - self.part_bytes) as usize;
            self.md4.update(&data[..take]);
            let digest = self.md4.finalize_reset();
            self.chunks.push(HashValue::new(HashAlgo::Md4, &digest).expect("md4 width"));
            data = &data[take..];
            self.part_bytes = 0;
        }
        self.md4.update(data);
        self.part_bytes += data.len() as u64;
    }

    /// Finish, producing the ED2K hashset.
    ///
    /// Protocol quirks preserved: a file smaller than one part uses its
    /// single part hash as the file hash and carries no part hashes; a
    /// file that is an exact multiple of the part size includes the
    /// hash of the empty tail part.
    fn finish(mut self) -> HashSet {
        let tail = self.md4.finalize();
        self.chunks.push(HashValue::new(HashAlgo::Md4, &tail).expect("md4 width"));

        let mut set = HashSet::ed2k();
        if self.chunks.len() == 1 {
            let only = self.chunks[0];
            set.set_file_hash(HashValue::new(HashAlgo::Ed2k, only.digest()).expect("md4 width"))
                .expect("ed2k algo");
        } else {
            let mut outer = Md4::new();
            for chunk in &self.chunks {
                outer.update(chunk.digest());
            }
            let file = outer.finalize();
            set.set_file_hash(HashValue::new(HashAlgo::Ed2k, &file).expect("md4 width"))
                .expect("ed2k algo");
            for chunk in self.chunks {
                set.add_chunk_hash(chunk).expect("md4 algo");
            }
        }
        set
    }
}

/// One running digest, selected by algorithm at runtime.
enum AlgoDigest {
    Md4(Md4),
    Md5(Md5),
    Sha1(Sha1),
    Ed2k(Ed2kMaker),
}

impl AlgoDigest {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Md4 => AlgoDigest::Md4(Md4::new()),
            HashAlgo::Md5 => AlgoDigest::Md5(Md5::new()),
            HashAlgo::Sha1 => AlgoDigest::Sha1(Sha1::new()),
            HashAlgo::Ed2k => AlgoDigest::Ed2k(Ed2kMaker::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            AlgoDigest::Md4(d) => d.update(data),
            AlgoDigest::Md5(d) => d.update(data),
            AlgoDigest::Sha1(d) => d.update(data),
            AlgoDigest::Ed2k(d) => d.update(data),
        }
    }

    fn finish(self) -> HashValue {
        match self {
            AlgoDigest::Md4(d) => HashValue::new(HashAlgo::Md4, &d.finalize()).expect("md4 width"),
            AlgoDigest::Md5(d) => HashValue::new(HashAlgo::Md5, &d.finalize()).expect("md5 width"),
            AlgoDigest::Sha1(d) => {
                HashValue::new(HashAlgo::Sha1, &d.finalize()).expect("sha1 width")
            }
            AlgoDigest::Ed2k(d) => *d.finish().file_hash(),
        }
    }
}

/// Hash a byte slice with one algorithm. Intended for small inputs
/// (tests, signatures); file data goes through [`HashWork`].
pub fn digest_bytes(algo: HashAlgo, data: &[u8]) -> HashValue {
    let mut d = AlgoDigest::new(algo);
    d.update(data);
    d.finish()
}

/// Build the full ED2K hashset of a byte slice.
pub fn ed2k_hash_set(data: &[u8]) -> HashSet {
    let mut maker = Ed2kMaker::new();
    maker.update(data);
    maker.finish()
}

// ── HashWork ─────────────────────────────────────────────────────

/// Outcome of a processed job.
#[derive(Debug, Clone)]
pub enum HashOutcome {
    /// Full job: freshly built metadata for the file.
    Complete(MetaData),
    /// Range job: the range matches the reference hash.
    Verified,
    /// Range job: the range does not match.
    Failed,
    /// The file disappeared or was unreadable mid-hash.
    Fatal(String),
}

#[derive(Debug, Clone)]
enum JobKind {
    Full,
    Range { begin: u64, end: u64, reference: HashValue },
}

/// A queued hash job.
#[derive(Debug)]
pub struct HashWork {
    path: PathBuf,
    kind: JobKind,
    valid: AtomicBool,
    /// Originating partial file, for completion routing.
    part: Option<PartId>,
    result: Mutex<Option<HashOutcome>>,
}

impl HashWork {
    /// Full hash of a file: every supported algorithm in one pass.
    pub fn full(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: JobKind::Full,
            valid: AtomicBool::new(true),
            part: None,
            result: Mutex::new(None),
        }
    }

    /// Verify `[begin, end]` (inclusive) against a reference hash.
    pub fn range(
        path: impl Into<PathBuf>,
        begin: u64,
        end: u64,
        reference: HashValue,
    ) -> Self {
        Self {
            path: path.into(),
            kind: JobKind::Range { begin, end, reference },
            valid: AtomicBool::new(true),
            part: None,
            result: Mutex::new(None),
        }
    }

    /// Tag the job with its originating partial file.
    pub fn for_part(mut self, part: PartId) -> Self {
        self.part = Some(part);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_full(&self) -> bool {
        matches!(self.kind, JobKind::Full)
    }

    pub fn range_bounds(&self) -> Option<(u64, u64)> {
        match &self.kind {
            JobKind::Range { begin, end, .. } => Some((*begin, *end)),
            JobKind::Full => None,
        }
    }

    pub fn reference(&self) -> Option<&HashValue> {
        match &self.kind {
            JobKind::Range { reference, .. } => Some(reference),
            JobKind::Full => None,
        }
    }

    pub fn part(&self) -> Option<PartId> {
        self.part
    }

    /// Drop a queued or in-flight job. The worker discards it without
    /// posting a completion event.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The outcome, once processed.
    pub fn outcome(&self) -> Option<HashOutcome> {
        self.result.lock().expect("hash result lock").clone()
    }

    // ── Processing (worker thread) ───────────────────────────────

    /// Run the job. Returns None when the job was invalidated or the
    /// worker is shutting down; the outcome is also stored on the job.
    pub(crate) fn process(&self, shutdown: &CancellationToken) -> Option<HashOutcome> {
        let started = Instant::now();
        let mut total = 0u64;
        let outcome = self.run(shutdown, &mut total);
        record_stats(total, started.elapsed());

        let outcome = outcome?;
        *self.result.lock().expect("hash result lock") = Some(outcome.clone());
        Some(outcome)
    }

    fn run(&self, shutdown: &CancellationToken, total: &mut u64) -> Option<HashOutcome> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) => return Some(HashOutcome::Fatal(e.to_string())),
        };

        let (mut remaining, mut digests) = match &self.kind {
            JobKind::Full => {
                let len = match file.metadata() {
                    Ok(m) => m.len(),
                    Err(e) => return Some(HashOutcome::Fatal(e.to_string())),
                };
                let all = vec![
                    AlgoDigest::new(HashAlgo::Ed2k),
                    AlgoDigest::new(HashAlgo::Md4),
                    AlgoDigest::new(HashAlgo::Md5),
                    AlgoDigest::new(HashAlgo::Sha1),
                ];
                (len, all)
            }
            JobKind::Range { begin, end, reference } => {
                if let Err(e) = file.seek(SeekFrom::Start(*begin)) {
                    return Some(HashOutcome::Fatal(e.to_string()));
                }
                (end - begin + 1, vec![AlgoDigest::new(reference.algo())])
            }
        };

        let mut buf = vec![0u8; HASH_BUF_SIZE];
        while remaining > 0 {
            if !self.is_valid() || shutdown.is_cancelled() {
                return None;
            }
            let want = remaining.min(HASH_BUF_SIZE as u64) as usize;
            match file.read(&mut buf[..want]) {
                Ok(0) => {
                    return Some(HashOutcome::Fatal("unexpected end of file".into()));
                }
                Ok(n) => {
                    for d in digests.iter_mut() {
                        d.update(&buf[..n]);
                    }
                    *total += n as u64;
                    remaining -= n as u64;
                }
                Err(e) => return Some(HashOutcome::Fatal(e.to_string())),
            }
        }

        match &self.kind {
            JobKind::Full => {
                let mut iter = digests.into_iter();
                let ed2k = match iter.next().expect("ed2k digest") {
                    AlgoDigest::Ed2k(maker) => maker.finish(),
                    _ => unreachable!("digest order"),
                };
                let mut md = MetaData::new(*total, file_mod_date(&self.path));
                if let Some(name) = self.path.file_name().and_then(|n| n.to_str()) {
                    md.add_name(name);
                }
                md.add_hash_set(ed2k);
                for digest in iter {
                    md.add_hash_set(HashSet::file_only(digest.finish()));
                }
                Some(HashOutcome::Complete(md))
            }
            JobKind::Range { reference, .. } => {
                let computed = digests.pop().expect("range digest").finish();
                if computed == *reference {
                    Some(HashOutcome::Verified)
                } else {
                    Some(HashOutcome::Failed)
                }
            }
        }
    }
}

fn file_mod_date(path: &Path) -> u32 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ed2k_small_file_has_no_part_hashes() {
        let set = ed2k_hash_set(b"hello world");
        assert_eq!(set.chunk_count(), 0);
        assert!(!set.file_hash().is_empty());
        // Matches a straight MD4 of the content.
        let md4 = digest_bytes(HashAlgo::Md4, b"hello world");
        assert_eq!(set.file_hash().digest(), md4.digest());
    }

    #[test]
    fn ed2k_multi_part_file() {
        // Two full parts and a little extra: three part hashes.
        let data = vec![0xABu8; ED2K_PART_SIZE as usize * 2 + 17];
        let set = ed2k_hash_set(&data);
        assert_eq!(set.chunk_count(), 3);

        // The file hash is the MD4 of the concatenated part digests.
        let mut outer = Md4::new();
        for chunk in set.chunk_hashes() {
            outer.update(chunk.digest());
        }
        assert_eq!(set.file_hash().digest(), &outer.finalize()[..]);
    }

    #[test]
    fn ed2k_exact_multiple_appends_empty_tail() {
        let data = vec![0u8; ED2K_PART_SIZE as usize];
        let set = ed2k_hash_set(&data);
        // One data part plus the empty tail part.
        assert_eq!(set.chunk_count(), 2);
        let empty_md4 = digest_bytes(HashAlgo::Md4, b"");
        assert_eq!(set.chunk_hash(1).unwrap().digest(), empty_md4.digest());
    }

    #[test]
    fn full_job_builds_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0x5A; 4096]).unwrap();
        drop(f);

        let job = HashWork::full(&path);
        let outcome = job.process(&CancellationToken::new()).unwrap();
        let HashOutcome::Complete(md) = outcome else {
            panic!("expected Complete, got {outcome:?}");
        };
        assert_eq!(md.size(), 4096);
        assert_eq!(md.name(), Some("sample.bin"));
        assert!(md.hash_set(HashAlgo::Ed2k).is_some());
        assert!(md.hash_set(HashAlgo::Md4).is_some());
        assert!(md.hash_set(HashAlgo::Md5).is_some());
        assert!(md.hash_set(HashAlgo::Sha1).is_some());
    }

    #[test]
    fn range_job_verifies_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, [0x11u8; 1000]).unwrap();

        let good = digest_bytes(HashAlgo::Md4, &[0x11u8; 500]);
        let job = HashWork::range(&path, 0, 499, good);
        assert!(matches!(
            job.process(&CancellationToken::new()),
            Some(HashOutcome::Verified)
        ));

        let bad = digest_bytes(HashAlgo::Md4, b"not the content");
        let job = HashWork::range(&path, 0, 499, bad);
        assert!(matches!(
            job.process(&CancellationToken::new()),
            Some(HashOutcome::Failed)
        ));
    }

    #[test]
    fn missing_file_is_fatal() {
        let job = HashWork::full("/nonexistent/path/file.bin");
        assert!(matches!(
            job.process(&CancellationToken::new()),
            Some(HashOutcome::Fatal(_))
        ));
    }

    #[test]
    fn invalidated_job_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, [0u8; 100_000]).unwrap();

        let job = HashWork::full(&path);
        job.invalidate();
        assert!(job.process(&CancellationToken::new()).is_none());
        assert!(job.outcome().is_none());
    }

    #[test]
    fn stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, [0u8; 2048]).unwrap();

        let before = hashed_bytes();
        HashWork::full(&path).process(&CancellationToken::new()).unwrap();
        assert!(hashed_bytes() >= before + 2048);
    }
}
