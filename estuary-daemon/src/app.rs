//! Service container and main loop.
//!
//! Construction order follows the dependency chain, leaves first:
//! config, events, worker thread, metadata index, files list,
//! scheduler, credits. Teardown runs in reverse and never touches a
//! service from another's destructor.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use estuary_core::config::keys;
use estuary_core::{
    ConfigStore, CoreEvent, CreditCrypto, CreditStore, EventQueue, EventReceiver, FilesList,
    MetaDb, Scheduler, UploadQueue, WorkThread,
};

/// Main loop tick interval.
const TICK_MS: u64 = 100;

/// Credit store snapshot interval.
const CREDIT_SAVE_MS: u64 = 12 * 60 * 1_000;

pub struct App {
    data_dir: PathBuf,
    config: ConfigStore,
    events_rx: EventReceiver,
    worker: Option<WorkThread>,
    metadb: MetaDb,
    files: FilesList,
    sched: Arc<Mutex<Scheduler>>,
    credits: CreditStore,
    #[allow(dead_code)]
    crypto: CreditCrypto,
    queue: UploadQueue,
    started: Instant,
    next_credit_save: u64,
}

impl App {
    /// Build every service in dependency order.
    pub fn bootstrap(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        std::fs::create_dir_all(data_dir.join("incoming"))?;

        // Config first; everything else reads its knobs from here.
        let mut config = ConfigStore::new();
        config.seed(keys::UP_SPEED_LIMIT, 25 * 1024u32);
        config.seed(keys::DOWN_SPEED_LIMIT, 0u32);
        config.seed(keys::CONNECTION_LIMIT, 300u32);
        let _ = config.load_file(&data_dir.join("config.json"));

        let (events, events_rx) = EventQueue::channel();
        config.set_events(events.clone());

        let worker = WorkThread::spawn(events.clone());

        let mut metadb = MetaDb::new();
        metadb.load_file(&data_dir.join("metadb.dat"));

        let mut files = FilesList::new(events.clone(), worker.queue());
        files.resume_downloads(&data_dir.join("incoming"));
        let shared = data_dir.join("shared");
        if shared.is_dir() {
            files.add_shared_dir(&shared);
        }

        let sched = Arc::new(Mutex::new(Scheduler::new()));
        for key in [
            keys::UP_SPEED_LIMIT,
            keys::DOWN_SPEED_LIMIT,
            keys::CONNECTION_LIMIT,
            keys::NEW_CONNS_PER_SEC,
            keys::CONNECTING_LIMIT,
        ] {
            if let Some(value) = config.get_raw(key) {
                sched.lock().expect("scheduler lock").handle_config_change(key, value);
            }
        }
        // The scheduler both vetoes and applies limit changes.
        let sched_veto = Arc::clone(&sched);
        config.subscribe_veto(Box::new(move |key, value| {
            sched_veto.lock().expect("scheduler lock").handle_config_change(key, value)
        }));

        let mut credits = CreditStore::new();
        credits.load_file(&data_dir.join("clients.met"), unix_now());
        let crypto = CreditCrypto::load_or_create(&data_dir.join("cryptkey.dat"))
            .map_err(std::io::Error::other)?;

        info!(
            target: "estuary::daemon",
            dir = %data_dir.display(),
            files = files.len(),
            metadata = metadb.len(),
            credits = credits.len(),
            "engine up"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            events_rx,
            worker: Some(worker),
            metadb,
            files,
            sched,
            credits,
            crypto,
            queue: UploadQueue::new(),
            started: Instant::now(),
            next_credit_save: CREDIT_SAVE_MS,
        })
    }

    /// The cooperative main loop: drain events, run the scheduler,
    /// resort the upload queue, take periodic snapshots.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tick = self.tick_now();
                    self.drain_events();
                    self.sched.lock().expect("scheduler lock").tick(tick);
                    self.service_upload_queue(tick);
                    if tick >= self.next_credit_save {
                        self.next_credit_save = tick + CREDIT_SAVE_MS;
                        self.save_credits();
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(target: "estuary::daemon", "shutdown requested");
                    break;
                }
            }
        }
    }

    /// Reverse-order teardown with final snapshots.
    pub fn shutdown(&mut self) {
        self.save_credits();
        self.files.save_all();
        if let Err(err) = self.metadb.save_file(&self.data_dir.join("metadb.dat")) {
            warn!(target: "estuary::daemon", %err, "metadb save failed");
        }
        if let Err(err) = self.config.save_file(&self.data_dir.join("config.json")) {
            warn!(target: "estuary::daemon", %err, "config save failed");
        }
        self.sched.lock().expect("scheduler lock").log_totals();
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        info!(target: "estuary::daemon", "engine down");
    }

    fn tick_now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                CoreEvent::HashDone(job) => match job.part() {
                    Some(part) => {
                        if let Some(pd) = self.files.part_by_id(part) {
                            Arc::clone(pd).on_hash_done(&job);
                        }
                    }
                    None => self.files.on_hash_done(&job, &mut self.metadb),
                },
                CoreEvent::MoveDone { part, error, .. } => {
                    self.files.on_move_done(part, error.as_deref());
                }
                CoreEvent::Part { part, event } => {
                    debug!(target: "estuary::daemon", %part, ?event, "part event");
                }
                CoreEvent::MetaAdded(id) => {
                    debug!(target: "estuary::daemon", ?id, "metadata indexed");
                }
                CoreEvent::FileAdded(id) | CoreEvent::FileRemoved(id) => {
                    debug!(target: "estuary::daemon", %id, "files list changed");
                }
                CoreEvent::ConfigChanged { key, value } => {
                    debug!(target: "estuary::daemon", key, value, "config changed");
                }
            }
        }
    }

    fn service_upload_queue(&mut self, tick: u64) {
        if !self.queue.resort_due(tick) {
            return;
        }
        let (rate, limit) = {
            let mut sched = self.sched.lock().expect("scheduler lock");
            (sched.up_speed(), sched.up_limit())
        };
        self.queue.tune_slots(rate, limit);
        let promoted = self.queue.resort(&self.credits, tick);
        for peer in promoted {
            // Protocol modules watch their peers' slots; nothing to
            // notify without modules attached.
            debug!(target: "estuary::daemon", ?peer, "upload slot opened");
        }
    }

    fn save_credits(&mut self) {
        if let Err(err) = self.credits.save_file(&self.data_dir.join("clients.met")) {
            warn!(target: "estuary::daemon", %err, "credit store save failed");
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
