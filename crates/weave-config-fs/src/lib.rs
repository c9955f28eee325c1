// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed `ConfigStore` for weave tools (uses the platform
//! config directory).

use directories::ProjectDirs;
use std::fs;
use std::path::PathBuf;
use weave_app_core::config::{ConfigError, ConfigStore};

/// Store configs as JSON files under the platform config directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory (e.g., `~/.config/weave`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "weave", "weave")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let filename = format!("{key}.json");
        self.base.join(filename)
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path_for(key);
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── missing key surfaces as ConfigError::NotFound, not a raw io error ──

    #[test]
    fn load_missing_key_is_not_found() {
        let dir = std::env::temp_dir().join(format!("weave-config-fs-test-{}", std::process::id()));
        let store = FsConfigStore { base: dir };
        match store.load_raw("does-not-exist") {
            Err(ConfigError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    // ── save then load round-trips raw bytes ──────────────────────────────

    #[test]
    fn save_then_load_round_trips_bytes() {
        let dir = std::env::temp_dir().join(format!("weave-config-fs-test-rt-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = FsConfigStore { base: dir.clone() };
        store.save_raw("hub", b"{\"socket_path\":\"/tmp/x\"}").unwrap();
        let loaded = store.load_raw("hub").unwrap();
        assert_eq!(loaded, b"{\"socket_path\":\"/tmp/x\"}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
