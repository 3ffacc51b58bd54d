// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed `ConfigStore` for phase tracker tools (uses platform config dir).

use directories::ProjectDirs;
use phase_core::config::{ConfigError, ConfigStore};
use std::fs;
use std::path::{Path, PathBuf};

/// Store configs as JSON files under a base directory.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory (e.g., `~/.config/phase-tracker`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "flyingrobots", "phase-tracker")
            .ok_or(ConfigError::NoConfigDir)?;
        Self::at(proj.config_dir())
    }

    /// Create a store rooted at `dir`, creating it if needed.
    pub fn at(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = dir.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Directory holding the config files.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// File backing `key`. Keys are plain names; separators are rejected.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, ConfigError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(ConfigError::InvalidKey(key.to_owned()));
        }
        Ok(self.base.join(format!("{key}.json")))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path_for(key)?;
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}
