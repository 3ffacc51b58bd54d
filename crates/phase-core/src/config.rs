// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tracker configuration plus the config service and storage port.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::phase::PhaseKind;

/// Logical key under which [`TrackerConfig`] is stored.
pub const TRACKER_CONFIG_KEY: &str = "tracker";

/// Tunables for [`crate::PhaseTracker`]. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Attach the full stack dump to corruption and dangling-phase logs.
    pub verbose: bool,
    /// Deepest nesting of child-context unwinds; deeper captures are discarded.
    pub max_unwind_depth: usize,
    /// Stack depth beyond which each push logs a warning.
    pub stack_warning_depth: usize,
    /// When false, neighbor notifications never fire their event.
    pub fire_neighbor_events: bool,
    /// Kinds whose bulk block capture is switched off.
    pub disabled_capture_kinds: Vec<PhaseKind>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            verbose: true,
            max_unwind_depth: 1000,
            stack_warning_depth: 64,
            fire_neighbor_events: true,
            disabled_capture_kinds: Vec::new(),
        }
    }
}

/// Where serialized config blobs live, addressed by plain key names.
///
/// Implemented by the filesystem adapter and by the in-memory test store.
pub trait ConfigStore {
    /// Raw bytes under `key`; [`ConfigError::NotFound`] when absent.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replaces the bytes under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure loading or saving a config value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing is stored under the key.
    #[error("config key not found")]
    NotFound,
    /// The key cannot name a stored value.
    #[error("invalid config key {0:?}")]
    InvalidKey(String),
    /// The platform has no user config directory.
    #[error("no user config directory on this platform")]
    NoConfigDir,
    /// Reading or writing the backing file failed.
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not valid JSON for the requested type.
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The store refused the operation.
    #[error("config store unavailable: {0}")]
    Unavailable(String),
}

/// JSON encoding on top of a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service writing through `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Value stored under `key`. A missing key and an empty blob both read
    /// as `None`.
    ///
    /// # Errors
    /// Store failures other than [`ConfigError::NotFound`], and
    /// [`ConfigError::Malformed`] when the bytes do not decode.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Writes `value` under `key` as pretty-printed JSON.
    ///
    /// # Errors
    /// Encoding or store failures.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        self.store.save_raw(key, &serde_json::to_vec_pretty(value)?)
    }

    /// Tracker config stored under [`TRACKER_CONFIG_KEY`], or the defaults.
    ///
    /// # Errors
    /// See [`ConfigService::load`].
    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        Ok(self.load(TRACKER_CONFIG_KEY)?.unwrap_or_default())
    }

    /// Persist `config` under [`TRACKER_CONFIG_KEY`].
    ///
    /// # Errors
    /// See [`ConfigService::save`].
    pub fn save_tracker_config(&self, config: &TrackerConfig) -> Result<(), ConfigError> {
        self.save(TRACKER_CONFIG_KEY, config)
    }
}
