//! Persistent application configuration model and defaults.

use std::path::PathBuf;

use crate::playback::queue_engine::QueueSettings;
use crate::protocol::RepeatMode;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Library indexing preferences.
    pub library: LibraryConfig,
    #[serde(default)]
    /// Queue behavior and remembered playback preferences.
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    /// Location of the SQLite store.
    pub storage: StorageConfig,
}

/// Library indexing preferences persisted between sessions.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub folders: Vec<String>,
    /// Records applied to the index per lock acquisition during a scan.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

/// Playback preferences persisted between sessions.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
    #[serde(default = "default_previous_restart_threshold_ms")]
    pub previous_restart_threshold_ms: u64,
    #[serde(default = "default_restart_state_persist_interval_ms")]
    pub restart_state_persist_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace` or `off`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Database file; defaults to `<data dir>/melodex/library.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            shuffle: false,
            repeat_mode: RepeatMode::Off,
            previous_restart_threshold_ms: default_previous_restart_threshold_ms(),
            restart_state_persist_interval_ms: default_restart_state_persist_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_scan_batch_size() -> usize {
    500
}

fn default_previous_restart_threshold_ms() -> u64 {
    3_000
}

fn default_restart_state_persist_interval_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn library_folders(&self) -> Vec<PathBuf> {
        self.library
            .folders
            .iter()
            .map(|folder| folder.trim())
            .filter(|folder| !folder.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Parsed log level; unknown values fall back to `Info`.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.logging
            .level
            .trim()
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            previous_restart_threshold_ms: self.playback.previous_restart_threshold_ms,
            restart_state_persist_interval_ms: self.playback.restart_state_persist_interval_ms,
            shuffle: self.playback.shuffle,
            repeat: self.playback.repeat_mode,
        }
    }

    pub fn scan_batch_size(&self) -> usize {
        self.library.scan_batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();
        assert!(config.library.folders.is_empty());
        assert_eq!(config.library.scan_batch_size, 500);
        assert!(!config.playback.shuffle);
        assert_eq!(config.playback.repeat_mode, RepeatMode::Off);
        assert_eq!(config.playback.previous_restart_threshold_ms, 3_000);
        assert_eq!(config.playback.restart_state_persist_interval_ms, 5_000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.database_path, None);
    }

    #[test]
    fn test_partial_config_fills_missing_fields_with_defaults() {
        let config: Config = toml::from_str(
            r#"
[library]
folders = ["/music", "  ", "/podcasts"]

[playback]
repeat_mode = "one"
"#,
        )
        .expect("config should parse");
        assert_eq!(
            config.library_folders(),
            vec![PathBuf::from("/music"), PathBuf::from("/podcasts")]
        );
        assert_eq!(config.library.scan_batch_size, 500);
        assert_eq!(config.playback.repeat_mode, RepeatMode::One);
        assert_eq!(config.queue_settings().repeat, RepeatMode::One);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_log_level_falls_back_to_info() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_string();
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
        config.logging.level = "chatty".to_string();
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_scan_batch_size_is_never_zero() {
        let mut config = Config::default();
        config.library.scan_batch_size = 0;
        assert_eq!(config.scan_batch_size(), 1);
    }
}
