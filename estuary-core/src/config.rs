//! Runtime configuration with veto'd hot reload.
//!
//! A flat key/value store. Writes run synchronously through every
//! registered validator first; any rejection keeps the old value and
//! surfaces [`CoreError::InvalidConfig`]. Accepted changes are
//! broadcast on the event bus so services can re-read their knobs.
//!
//! The engine's own keys are listed in [`keys`]; per-module
//! recommendations use the `<module>/Key` form.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::events::{CoreEvent, EventQueue};

/// On-disk shape of the configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    values: HashMap<String, String>,
}

/// Well-known configuration keys.
pub mod keys {
    /// Max upstream bytes/sec; 0 is refused.
    pub const UP_SPEED_LIMIT: &str = "UpSpeedLimit";
    /// Max downstream bytes/sec; 0 means unlimited.
    pub const DOWN_SPEED_LIMIT: &str = "DownSpeedLimit";
    /// Max concurrent sockets.
    pub const CONNECTION_LIMIT: &str = "ConnectionLimit";
    /// Outgoing connects per second.
    pub const NEW_CONNS_PER_SEC: &str = "NewConnsPerSec";
    /// Max in-flight outgoing connect attempts.
    pub const CONNECTING_LIMIT: &str = "ConnectingLimit";

    /// `<module>/UpLimit`, `<module>/DownLimit`.
    pub fn module_key(module: &str, key: &str) -> String {
        format!("{module}/{key}")
    }
}

type Validator = Box<dyn Fn(&str, &str) -> bool + Send>;

/// The configuration store.
#[derive(Default)]
pub struct ConfigStore {
    values: HashMap<String, String>,
    validators: Vec<Validator>,
    events: Option<EventQueue>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the event bus; accepted changes are announced on it.
    pub fn set_events(&mut self, events: EventQueue) {
        self.events = Some(events);
    }

    /// Register a veto subscriber. Validators run synchronously on
    /// every write, in registration order; the first rejection wins.
    pub fn subscribe_veto(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Set a value, subject to veto.
    pub fn set(&mut self, key: &str, value: impl ToString) -> Result<(), CoreError> {
        let value = value.to_string();
        for validator in &self.validators {
            if !validator(key, &value) {
                warn!(target: "estuary::config", key, value, "config change vetoed");
                return Err(CoreError::InvalidConfig { key: key.to_string(), value });
            }
        }
        self.values.insert(key.to_string(), value.clone());
        if let Some(events) = &self.events {
            events.post(CoreEvent::ConfigChanged { key: key.to_string(), value });
        }
        Ok(())
    }

    /// Seed a default without running validators or announcements;
    /// existing values win.
    pub fn seed(&mut self, key: &str, value: impl ToString) {
        self.values.entry(key.to_string()).or_insert_with(|| value.to_string());
    }

    // ── Persistence (JSON map) ───────────────────────────────────

    pub fn load_file(&mut self, path: &Path) -> Result<(), CoreError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: ConfigFile =
            serde_json::from_str(&raw).map_err(|_| CoreError::Stream("config file"))?;
        // Loaded values bypass veto: they were accepted when written.
        self.values.extend(parsed.values);
        info!(target: "estuary::config", path = %path.display(), "configuration loaded");
        Ok(())
    }

    pub fn save_file(&self, path: &Path) -> Result<(), CoreError> {
        let file = ConfigFile { values: self.values.clone() };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|_| CoreError::Stream("config encode"))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
