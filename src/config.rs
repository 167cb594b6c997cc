//! Configuration management for folio
//!
//! Stores settings in ~/.config/folio/config.json

use crate::cache::{CacheSettings, DEFAULT_TTL_MS};
use crate::prefetch::DEFAULT_MAX_AUTO_PRELOAD;
use crate::store::chunked::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const ROOT_DIRECTORY_ENV: &str = "FOLIO_ROOT_DIRECTORY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Lifetime of persistent cache entries, in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: i64,
    /// Where documents are fetched from: a local directory or an http(s) URL
    #[serde(default = "default_root_directory")]
    pub root_directory: String,
    /// Neighbours preloaded after each document load
    #[serde(default = "default_max_auto_preload")]
    pub max_auto_preload: usize,
    /// Cap for a full-tree preload; unbounded when absent
    #[serde(default)]
    pub max_manual_preload: Option<usize>,
    /// Characters per persisted chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Seconds between periodic expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Document tree JSON describing every known document
    #[serde(default = "default_tree_file")]
    pub tree_file: PathBuf,
    /// Directory backing the persistent store; platform data dir when absent
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_cache_ttl_ms() -> i64 {
    DEFAULT_TTL_MS
}

fn default_root_directory() -> String {
    "docs".to_string()
}

fn default_max_auto_preload() -> usize {
    DEFAULT_MAX_AUTO_PRELOAD
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_tree_file() -> PathBuf {
    PathBuf::from("docs/tree.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
            root_directory: default_root_directory(),
            max_auto_preload: default_max_auto_preload(),
            max_manual_preload: None,
            chunk_size: default_chunk_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            tree_file: default_tree_file(),
            state_dir: None,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("folio"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .and_then(|path| fs::read_to_string(&path).ok().map(|content| (path, content)))
            .map(|(path, content)| Self::parse_or_preserve(&path, &content))
            .unwrap_or_default();
        config.apply_env();
        config
    }

    fn parse_or_preserve(path: &std::path::Path, content: &str) -> Self {
        match serde_json::from_str(content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, content);
                tracing::warn!(
                    "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Self::default()
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_DIRECTORY_ENV) {
            if !root.trim().is_empty() {
                self.root_directory = root;
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                tracing::warn!("Failed to set config directory permissions: {}", e);
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        write_config_atomic(&dir.join("config.json"), &content)
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/folio/config.json".to_string())
    }

    /// Directory holding the persistent cache store.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("folio")
                .join("cache")
        })
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl_ms: self.cache_ttl_ms,
            chunk_size: self.chunk_size.max(1),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cache_ttl_ms, 600_000);
        assert_eq!(config.max_auto_preload, 3);
        assert_eq!(config.max_manual_preload, None);
        assert_eq!(config.chunk_size, 500_000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"root_directory":"https://example.com/docs","max_manual_preload":20}"#)
                .unwrap();
        assert_eq!(config.root_directory, "https://example.com/docs");
        assert_eq!(config.max_manual_preload, Some(20));
        assert_eq!(config.cache_ttl_ms, DEFAULT_TTL_MS);
        assert_eq!(config.tree_file, PathBuf::from("docs/tree.json"));
    }

    #[test]
    fn corrupt_config_is_preserved_and_defaults_used() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = Config::parse_or_preserve(&path, "{ not json");
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("config.json.corrupt")).unwrap(),
            "{ not json"
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        write_config_atomic(&path, "one").unwrap();
        write_config_atomic(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!tmp.path().join("config.tmp").exists());
    }

    #[test]
    fn cache_settings_follow_config() {
        let config = Config {
            cache_ttl_ms: 1_000,
            chunk_size: 0,
            state_dir: Some(PathBuf::from("/tmp/folio-state")),
            ..Config::default()
        };
        assert_eq!(
            config.cache_settings(),
            CacheSettings {
                ttl_ms: 1_000,
                chunk_size: 1
            }
        );
        assert_eq!(config.resolved_state_dir(), PathBuf::from("/tmp/folio-state"));
    }
}
