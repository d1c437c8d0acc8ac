//! # estuary-core
//!
//! Protocol-agnostic transfer engine for a multi-network peer-to-peer
//! client. Protocol modules (eDonkey, BitTorrent, HTTP, ...) plug into
//! this crate; they speak their own wire formats but share one pool of
//! files, one bandwidth budget and one credit ledger.
//!
//! This crate contains:
//! - **Partial files**: `PartData`, chunk grids, `UsedRange` /
//!   `LockedRange` write reservations
//! - **Metadata**: `MetaData` records, `HashSet`s, the `MetaDb`
//!   cross-reference index
//! - **Hashing**: `HashWork` jobs, streaming MD4/MD5/SHA-1/ED2K
//!   digests, the I/O worker thread
//! - **Scheduling**: the `Scheduler` dividing bandwidth and connection
//!   budget across request lists
//! - **Uploads**: the score-ordered `UploadQueue` and the persisted
//!   `CreditStore` with slot signatures
//! - **Plumbing**: typed event bus, range lists, wire codec,
//!   configuration store, `CoreError`

pub mod config;
pub mod credits;
pub mod error;
pub mod events;
pub mod fileslist;
pub mod hash;
pub mod hasher;
pub mod hashset;
pub mod metadata;
pub mod metadb;
pub mod part;
pub mod range;
pub mod sched;
pub mod sharedfile;
pub mod upload;
pub mod wire;
pub mod work;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::ConfigStore;
pub use credits::{CreditCrypto, CreditStore, Credits};
pub use error::CoreError;
pub use events::{CoreEvent, EventQueue, EventReceiver, PartEvent};
pub use fileslist::FilesList;
pub use hash::{HashAlgo, HashValue};
pub use hasher::{HashOutcome, HashWork};
pub use hashset::{HashSet, ED2K_PART_SIZE};
pub use metadata::MetaData;
pub use metadb::{MetaDb, MetaId};
pub use part::{LockedRange, PartData, PartId, PartState, UsedRange};
pub use range::{Range32, Range64, RangeList32, RangeList64};
pub use sched::{ConnRequest, ConnResult, DownloadRequest, ReqHandle, Scheduler, UploadRequest};
pub use sharedfile::{FileId, SharedFile};
pub use upload::{PeerId, UploadQueue};
pub use work::{WorkQueue, WorkThread};
