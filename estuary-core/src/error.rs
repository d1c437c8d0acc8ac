//! Error types for the transfer engine.
//!
//! All fallible operations return `Result<T, CoreError>`. Flow-control
//! outcomes that are not failures (`NoNeededParts`) are still variants so
//! callers can match on them instead of inventing sentinel values.

use thiserror::Error;

/// The canonical error type of the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Parse / persistence errors ───────────────────────────────
    /// Unexpected end of stream or malformed field while parsing
    /// persisted data or a wire frame. The parse is aborted and prior
    /// state kept.
    #[error("unexpected end of stream: {0}")]
    Stream(&'static str),

    /// A numeric value did not map to any known discriminant.
    #[error("unknown {what} discriminant: {value:#x}")]
    UnknownVariant { what: &'static str, value: u64 },

    // ── Hashing errors ───────────────────────────────────────────
    /// Range verification failed. Recovered by re-opening the range
    /// for download; never surfaced to the user as an error.
    #[error("hash mismatch over [{begin}, {end}]")]
    HashMismatch { begin: u64, end: u64 },

    /// The underlying file disappeared or became unreadable mid-hash.
    /// Fatal for the owning download.
    #[error("fatal hash error on {path}: {source}")]
    FatalHash {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Disk errors ──────────────────────────────────────────────
    /// Write or flush failure; fatal for the affected file only.
    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    // ── Reservation errors ───────────────────────────────────────
    /// Lock, write or verify outside an owned reservation.
    #[error("range conflict: {0}")]
    RangeConflict(&'static str),

    /// Nothing left to assign to this peer; expected flow control.
    #[error("no needed parts")]
    NoNeededParts,

    // ── Configuration / hooks ────────────────────────────────────
    /// A pending value change was vetoed by a subscriber; the old
    /// value is retained.
    #[error("config value rejected: {key} = {value}")]
    InvalidConfig { key: String, value: String },

    /// Reported by protocol modules through the filter hook.
    #[error("protocol error: {0}")]
    Protocol(String),

    // ── Plumbing ─────────────────────────────────────────────────
    /// A channel between the main loop and the worker was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Build a `RangeConflict`, asserting in debug builds.
    ///
    /// Reservation violations are programming errors: they abort in
    /// debug and degrade to a logged warning in release.
    pub fn range_conflict(what: &'static str) -> Self {
        debug_assert!(false, "range conflict: {what}");
        tracing::warn!(target: "estuary::part", "range conflict: {what}");
        CoreError::RangeConflict(what)
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoreError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CoreError::ChannelClosed
    }
}
