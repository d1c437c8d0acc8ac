//! End-to-end scenarios across the engine: full download round trips,
//! corruption recovery, multi-source writes, metadata dedup, scheduler
//! budgeting and upload-queue rotation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use estuary_core::{
    CoreError, CoreEvent, CreditStore, EventQueue, EventReceiver, FilesList, HashAlgo, HashSet,
    HashValue, MetaData, MetaDb, PartData, PartEvent, PartState, PeerId, Range64, Scheduler,
    UploadQueue, UploadRequest, WorkThread,
};
use estuary_core::hasher::{digest_bytes, ed2k_hash_set};
use estuary_core::upload::SESSION_BYTE_CAP;

// ── Helpers ──────────────────────────────────────────────────────

fn engine() -> (tempfile::TempDir, EventQueue, EventReceiver, WorkThread) {
    let dir = tempfile::tempdir().unwrap();
    let (events, rx) = EventQueue::channel();
    let worker = WorkThread::spawn(events.clone());
    (dir, events, rx, worker)
}

/// Wait for the next event matching `pick`, pumping with a timeout.
fn wait_for<T>(
    rx: &mut EventReceiver,
    mut pick: impl FnMut(&CoreEvent) -> Option<T>,
) -> T {
    for _ in 0..2_000 {
        match rx.try_recv() {
            Ok(ev) => {
                if let Some(out) = pick(&ev) {
                    return out;
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    panic!("expected event did not arrive");
}

/// Drive a part's queued verify job to completion and route it back.
fn finish_verification(pd: &Arc<PartData>, rx: &mut EventReceiver) {
    let part = pd.id();
    let job = wait_for(rx, |ev| match ev {
        CoreEvent::HashDone(job) if job.part() == Some(part) => Some(Arc::clone(job)),
        _ => None,
    });
    pd.on_hash_done(&job);
}

/// Wait for the mover and route its completion back into the part.
fn finish_move(pd: &Arc<PartData>, rx: &mut EventReceiver) {
    let part = pd.id();
    let error = wait_for(rx, |ev| match ev {
        CoreEvent::MoveDone { part: p, error, .. } if *p == part => Some(error.clone()),
        _ => None,
    });
    pd.on_move_done(error.as_deref());
}

// ── Scenario 1: 1 MiB round trip ─────────────────────────────────

#[test]
fn round_trip_one_mib_download() {
    let (dir, events, mut rx, worker) = engine();
    let dest = dir.path().join("payload.bin");
    let pd =
        PartData::create(&dest, 1_048_576, None, events.clone(), worker.queue()).unwrap();

    let used = pd.get_range(1_048_576, None).unwrap();
    assert_eq!(used.range(), Range64::new(0, 1_048_575));

    let lock = used.get_lock(1_048_576).unwrap();
    lock.write(0, &vec![0xAA; 1_048_576]).unwrap();
    assert!(lock.is_complete());

    assert_eq!(pd.completed(), 1_048_576);
    assert!(pd.is_complete());

    finish_move(&pd, &mut rx);
    assert_eq!(pd.state(), PartState::Complete);
    let on_disk = std::fs::read(&dest).unwrap();
    assert_eq!(on_disk.len(), 1_048_576);
    assert!(on_disk.iter().all(|&b| b == 0xAA));
}

// ── Scenario 2: two-chunk download with corruption ───────────────

#[test]
fn two_chunk_download_with_corruption() {
    const PART: usize = 9_728_000;
    let (dir, events, mut rx, worker) = engine();

    let good0 = vec![0x11u8; PART];
    let good1 = vec![0x22u8; PART];
    let h0 = digest_bytes(HashAlgo::Md4, &good0);
    let h1 = digest_bytes(HashAlgo::Md4, &good1);

    let mut hs = HashSet::ed2k();
    hs.add_chunk_hash(h0).unwrap();
    hs.add_chunk_hash(h1).unwrap();
    let mut meta = MetaData::new(2 * PART as u64, 0);
    meta.add_hash_set(hs);

    let dest = dir.path().join("movie.avi");
    let pd = PartData::create(&dest, 2 * PART as u64, Some(&meta), events, worker.queue())
        .unwrap();

    // Chunk 0: correct data, verifies, stays complete.
    let used = pd.get_range(PART as u64, Some(&[true, false])).unwrap();
    let lock = used.get_lock(PART as u64).unwrap();
    lock.write(0, &good0).unwrap();
    pd.verify(Range64::new(0, PART as u64 - 1), h0, true).unwrap();
    finish_verification(&pd, &mut rx);

    let chunks = pd.grid_chunks(PART as u64).unwrap();
    assert!(chunks[0].is_verified() && chunks[0].is_complete());
    assert_eq!(pd.completed(), PART as u64);

    // Chunk 1: junk, fails verification, rolls back.
    let used = pd.get_range(PART as u64, Some(&[false, true])).unwrap();
    let lock = used.get_lock(PART as u64).unwrap();
    lock.write(PART as u64, &vec![0x33u8; PART]).unwrap();
    assert_eq!(pd.completed(), 2 * PART as u64);

    pd.verify(Range64::new(PART as u64, 2 * PART as u64 - 1), h1, true).unwrap();
    finish_verification(&pd, &mut rx);

    let chunks = pd.grid_chunks(PART as u64).unwrap();
    assert!(!chunks[1].is_complete() && !chunks[1].is_verified());
    assert_eq!(pd.completed(), PART as u64);
    assert!(!pd.is_complete());
}

// ── Scenario 3: multi-source convergence ─────────────────────────

#[test]
fn multi_source_out_of_order_writes() {
    let (dir, events, mut rx, worker) = engine();
    let dest = dir.path().join("twopeer.bin");
    let pd = PartData::create(&dest, 10_000, None, events, worker.queue()).unwrap();

    // Two peers holding disjoint halves.
    let used_a = pd.get_range(5_000, Some(&[true, false])).unwrap();
    let used_b = pd.get_range(5_000, Some(&[false, true])).unwrap();
    assert_eq!(used_a.range(), Range64::new(0, 4_999));
    assert_eq!(used_b.range(), Range64::new(5_000, 9_999));

    let lock_a = used_a.get_lock(2_500).unwrap();
    let lock_b = used_b.get_lock(2_500).unwrap();
    assert_eq!(lock_a.range(), Range64::new(0, 2_499));
    assert_eq!(lock_b.range(), Range64::new(5_000, 7_499));

    // Writes land out of order.
    lock_b.write(5_000, &vec![0xBB; 2_500]).unwrap();
    lock_a.write(0, &vec![0xAA; 2_500]).unwrap();
    assert!(lock_a.is_complete() && lock_b.is_complete());
    assert_eq!(pd.completed(), 5_000);

    // Fill in the rest from both peers and let it complete.
    let lock_a2 = used_a.get_lock(2_500).unwrap();
    lock_a2.write(2_500, &vec![0xAA; 2_500]).unwrap();
    let lock_b2 = used_b.get_lock(2_500).unwrap();
    lock_b2.write(7_500, &vec![0xBB; 2_500]).unwrap();

    assert!(pd.is_complete());
    finish_move(&pd, &mut rx);

    let on_disk = std::fs::read(&dest).unwrap();
    assert!(on_disk[..5_000].iter().all(|&b| b == 0xAA));
    assert!(on_disk[5_000..].iter().all(|&b| b == 0xBB));
}

// ── Scenario 4: metadata dedup ───────────────────────────────────

#[test]
fn metadb_dedup_and_merge() {
    fn file_only(algo: HashAlgo, b: u8) -> HashSet {
        let digest = vec![b; algo.digest_len()];
        HashSet::file_only(HashValue::new(algo, &digest).unwrap())
    }
    let e = HashValue::new(HashAlgo::Ed2k, &[0xE0; 16]).unwrap();
    let s = HashValue::new(HashAlgo::Sha1, &[0x51; 20]).unwrap();
    let m = HashValue::new(HashAlgo::Md5, &[0xD5; 16]).unwrap();

    let mut db = MetaDb::new();

    let mut m1 = MetaData::new(1_000, 0);
    m1.add_name("f");
    m1.add_hash_set(HashSet::file_only(e));
    m1.add_hash_set(HashSet::file_only(s));
    let id1 = db.insert(m1);

    let mut m2 = MetaData::new(1_000, 0);
    m2.add_name("f");
    m2.add_hash_set(HashSet::file_only(m));
    let id2 = db.insert(m2);

    assert_eq!(db.id_by_hash(&e), Some(id1));
    assert_eq!(db.id_by_hash(&m), Some(id2));
    assert_eq!(db.find_by_name("f").len(), 2);

    let mut m3 = MetaData::new(1_000, 0);
    m3.add_name("g");
    m3.add_hash_set(file_only(HashAlgo::Ed2k, 0xE0));
    let id3 = db.insert(m3);

    assert_eq!(id3, id1);
    assert_eq!(db.len(), 2);
    let merged = db.find_by_hash(&e).unwrap();
    assert!(merged.hash_set(HashAlgo::Sha1).is_some());
    let names: Vec<&str> = merged.names().iter().map(|n| n.name.as_str()).collect();
    assert!(names.contains(&"f") && names.contains(&"g"));
}

// ── Scenario 5: scheduler budget ─────────────────────────────────

struct MeteredUpload {
    tag: &'static str,
    pending: u32,
    grants: Arc<Mutex<Vec<(&'static str, u32)>>>,
}

impl UploadRequest for MeteredUpload {
    fn do_send(&mut self, amount: u32) -> u32 {
        let take = amount.min(self.pending);
        self.pending -= take;
        self.grants.lock().unwrap().push((self.tag, take));
        take
    }

    fn pending(&self) -> u32 {
        self.pending
    }
}

#[test]
fn scheduler_divides_upload_budget() {
    let mut sched = Scheduler::new();
    assert!(sched.handle_config_change("UpSpeedLimit", "50000"));

    let grants = Arc::new(Mutex::new(Vec::new()));
    for (tag, score) in [("low", 1.0f32), ("high", 3.0), ("mid", 2.0)] {
        sched.add_upload(
            score,
            Box::new(MeteredUpload {
                tag,
                pending: 100_000,
                grants: Arc::clone(&grants),
            }),
        );
    }

    sched.tick(60_000);

    let got = grants.lock().unwrap().clone();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0], ("high", 16_666));
    assert_eq!(got[1], ("mid", 16_667));
    assert_eq!(got[2], ("low", 16_667));

    // Budget consumed; the next tick in the same window grants
    // nothing (remaining budget is under the 500-byte floor).
    sched.tick(60_010);
    assert_eq!(grants.lock().unwrap().len(), 3);
}

// ── Scenario 6: upload queue rotation ────────────────────────────

#[test]
fn upload_queue_rotation() {
    let mut credits = CreditStore::new();
    // Peer A has earned the maximal score; B and C are strangers.
    credits
        .create(vec![0xA], [0xA; 16])
        .add_downloaded(200 * 1024 * 1024);

    let mut queue = UploadQueue::new();
    let (a, b, c) = (PeerId::from_raw(1), PeerId::from_raw(2), PeerId::from_raw(3));
    queue.ask(a, 0.0, &[0xA], 0);
    queue.ask(b, 0.0, &[0xB], 0);
    queue.ask(c, 0.0, &[0xC], 0);

    let promoted = queue.resort(&credits, 1_000);
    assert_eq!(promoted, vec![a]);

    // A burns through its session budget and rotates out.
    assert!(queue.record_sent(a, SESSION_BYTE_CAP, 2_000));
    let promoted = queue.resort(&credits, 2_000);

    // B and C tied; insertion order wins. A re-queued at the tail.
    assert_eq!(promoted, vec![b]);
    assert_eq!(queue.rank_of(c), 1);
    assert_eq!(queue.rank_of(a), 2);
}

// ── Cross-subsystem: share, hash, serve ──────────────────────────

#[test]
fn shared_file_serves_verified_content() {
    let (dir, events, mut rx, worker) = engine();
    let path = dir.path().join("serve.bin");
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let mut files = FilesList::new(events, worker.queue());
    let mut metadb = MetaDb::new();
    let id = files.add_shared_file(&path).unwrap();

    let job = wait_for(&mut rx, |ev| match ev {
        CoreEvent::HashDone(job) => Some(Arc::clone(job)),
        _ => None,
    });
    files.on_hash_done(&job, &mut metadb);

    // The index knows the file by its ED2K hash now.
    let meta = metadb.find_by_file(id).unwrap();
    let expected = ed2k_hash_set(&content);
    assert_eq!(
        meta.hash_set(HashAlgo::Ed2k).unwrap().file_hash(),
        expected.file_hash()
    );
    assert_eq!(metadb.find_file_by_hash(expected.file_hash()), Some(id));

    // And the upload path reads the same bytes a peer would get.
    let served = files.get(id).unwrap().read(1_000, 1_999).unwrap();
    assert_eq!(served, &content[1_000..2_000]);
}

// ── Part events reach observers ──────────────────────────────────

#[test]
fn part_events_are_broadcast() {
    let (dir, events, mut rx, worker) = engine();
    let pd = PartData::create(
        dir.path().join("events.bin"),
        10_000,
        None,
        events,
        worker.queue(),
    )
    .unwrap();

    let used = pd.get_range(10_000, None).unwrap();
    let lock = used.get_lock(2_000).unwrap();
    lock.write(0, &[1u8; 2_000]).unwrap();

    let part = pd.id();
    let (begin, len) = wait_for(&mut rx, |ev| match ev {
        CoreEvent::Part { part: p, event: PartEvent::DataAdded { begin, len } }
            if *p == part =>
        {
            Some((*begin, *len))
        }
        _ => None,
    });
    assert_eq!((begin, len), (0, 2_000));

    pd.corruption(Range64::new(0, 1_999));
    let len = wait_for(&mut rx, |ev| match ev {
        CoreEvent::Part { part: p, event: PartEvent::Corruption { len, .. } } if *p == part => {
            Some(*len)
        }
        _ => None,
    });
    assert_eq!(len, 2_000);

    pd.pause();
    let state = wait_for(&mut rx, |ev| match ev {
        CoreEvent::Part { part: p, event: PartEvent::StateChanged(s) } if *p == part => Some(*s),
        _ => None,
    });
    assert_eq!(state, PartState::Paused);
}

// ── NoNeededParts flow control ───────────────────────────────────

#[test]
fn exhausted_part_reports_no_needed_parts() {
    let (dir, events, _rx, worker) = engine();
    let pd = PartData::create(
        dir.path().join("done.bin"),
        4_000,
        None,
        events,
        worker.queue(),
    )
    .unwrap();

    let used = pd.get_range(4_000, None).unwrap();
    let lock = used.get_lock(4_000).unwrap();
    lock.write(0, &[5u8; 4_000]).unwrap();

    // Everything written: nothing left to hand out.
    assert!(matches!(pd.get_range(4_000, None), Err(CoreError::NoNeededParts)));
}

// ── Connection pacing across ticks ───────────────────────────────

#[test]
fn connection_grants_follow_configured_rate() {
    use estuary_core::{ConnRequest, ConnResult};

    struct Probe {
        fired: Arc<AtomicU32>,
    }
    impl ConnRequest for Probe {
        fn do_conn(&mut self) -> ConnResult {
            self.fired.fetch_add(1, Ordering::Relaxed);
            ConnResult::REMOVE | ConnResult::ADDCONN
        }
        fn is_outgoing(&self) -> bool {
            true
        }
    }

    let mut sched = Scheduler::new();
    assert!(sched.handle_config_change("NewConnsPerSec", "2"));

    let fired = Arc::new(AtomicU32::new(0));
    for _ in 0..4 {
        sched.add_connection(1.0, Box::new(Probe { fired: Arc::clone(&fired) }));
    }

    // 2/sec means one grant each 500 ms.
    sched.tick(10_000);
    sched.tick(10_100);
    sched.tick(10_500);
    sched.tick(11_000);
    assert_eq!(fired.load(Ordering::Relaxed), 3);
    assert_eq!(sched.conn_count(), 3);
}
