// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory config store fake for testing without filesystem I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use phase_core::config::{ConfigError, ConfigStore, TrackerConfig, TRACKER_CONFIG_KEY};

/// In-memory [`ConfigStore`] that counts calls and can simulate failures.
///
/// # Example
///
/// ```
/// use phase_core::config::{ConfigService, TrackerConfig};
/// use phase_dry_tests::InMemoryConfigStore;
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
/// let config = TrackerConfig { verbose: false, ..TrackerConfig::default() };
/// service.save_tracker_config(&config).unwrap();
/// assert_eq!(service.tracker_config().unwrap(), config);
/// assert_eq!(store.save_count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    data: HashMap<String, Vec<u8>>,
    loads: usize,
    saves: usize,
    fail_on_load: bool,
    fail_on_save: bool,
}

impl InMemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with raw blobs.
    pub fn with_data(data: HashMap<String, Vec<u8>>) -> Self {
        let store = Self::new();
        store.state().data = data;
        store
    }

    /// Store holding `config` under the tracker key, serialized the way
    /// the config service writes it.
    pub fn with_tracker_config(config: &TrackerConfig) -> Result<Self, ConfigError> {
        let store = Self::new();
        let bytes = serde_json::to_vec_pretty(config)?;
        store.state().data.insert(TRACKER_CONFIG_KEY.to_owned(), bytes);
        Ok(store)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every load fail with [`ConfigError::Unavailable`].
    pub fn set_fail_on_load(&self, fail: bool) {
        self.state().fail_on_load = fail;
    }

    /// Makes every save fail with [`ConfigError::Unavailable`].
    pub fn set_fail_on_save(&self, fail: bool) {
        self.state().fail_on_save = fail;
    }

    /// Load attempts, failed ones included.
    pub fn load_count(&self) -> usize {
        self.state().loads
    }

    /// Save attempts, failed ones included.
    pub fn save_count(&self) -> usize {
        self.state().saves
    }

    /// Keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.state().data.keys().cloned().collect()
    }

    /// Whether `key` is stored.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state().data.contains_key(key)
    }

    /// Raw blob under `key`, bypassing the counters.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state().data.get(key).cloned()
    }

    /// Clears data, counters and failure switches.
    pub fn reset(&self) {
        *self.state() = StoreState::default();
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut state = self.state();
        state.loads += 1;
        if state.fail_on_load {
            return Err(ConfigError::Unavailable("simulated load failure".into()));
        }
        state.data.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut state = self.state();
        state.saves += 1;
        if state.fail_on_save {
            return Err(ConfigError::Unavailable("simulated save failure".into()));
        }
        state.data.insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}
