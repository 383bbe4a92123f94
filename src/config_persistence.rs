//! Loading and comment-preserving write-back of `config.toml`.

use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{value, Array, DocumentMut, Item, Table};

use crate::config::Config;
use crate::error::ConfigError;
use crate::protocol::RepeatMode;

/// Written on first start so users find every option documented.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# melodex configuration

[library]
# Folders scanned for audio files.
folders = []
# Tracks applied to the index per batch while scanning.
scan_batch_size = 500

[playback]
shuffle = false
# off, all or one
repeat_mode = "off"
# "Previous" restarts the current track after this much playback.
previous_restart_threshold_ms = 3000
restart_state_persist_interval_ms = 5000

[logging]
level = "info"

[storage]
# database_path = "/path/to/library.db"
"#;

/// `<config dir>/melodex/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("melodex").join("config.toml"))
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn set_table_scalar_if_changed<T, F>(
    table: &mut Table,
    key: &str,
    previous_value: T,
    next_value: T,
    to_item: F,
) where
    T: PartialEq,
    F: FnOnce(T) -> Item,
{
    if table.contains_key(key) && previous_value == next_value {
        return;
    }
    set_table_value_preserving_decor(table, key, to_item(next_value));
}

fn section_table<'a>(document: &'a mut DocumentMut, key: &str) -> Option<&'a mut Table> {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
    root.get_mut(key).and_then(Item::as_table_mut)
}

fn repeat_mode_name(repeat: RepeatMode) -> &'static str {
    match repeat {
        RepeatMode::Off => "off",
        RepeatMode::All => "all",
        RepeatMode::One => "one",
    }
}

fn write_config_to_document(document: &mut DocumentMut, previous: &Config, config: &Config) {
    if let Some(library) = section_table(document, "library") {
        if !library.contains_key("folders") || previous.library.folders != config.library.folders {
            let folders: Array = config.library.folders.iter().map(String::as_str).collect();
            set_table_value_preserving_decor(library, "folders", value(folders));
        }
        set_table_scalar_if_changed(
            library,
            "scan_batch_size",
            previous.library.scan_batch_size as i64,
            config.library.scan_batch_size as i64,
            value,
        );
    }

    if let Some(playback) = section_table(document, "playback") {
        set_table_scalar_if_changed(
            playback,
            "shuffle",
            previous.playback.shuffle,
            config.playback.shuffle,
            value,
        );
        set_table_scalar_if_changed(
            playback,
            "repeat_mode",
            repeat_mode_name(previous.playback.repeat_mode),
            repeat_mode_name(config.playback.repeat_mode),
            value,
        );
        set_table_scalar_if_changed(
            playback,
            "previous_restart_threshold_ms",
            previous.playback.previous_restart_threshold_ms as i64,
            config.playback.previous_restart_threshold_ms as i64,
            value,
        );
        set_table_scalar_if_changed(
            playback,
            "restart_state_persist_interval_ms",
            previous.playback.restart_state_persist_interval_ms as i64,
            config.playback.restart_state_persist_interval_ms as i64,
            value,
        );
    }

    if let Some(logging) = section_table(document, "logging") {
        set_table_scalar_if_changed(
            logging,
            "level",
            previous.logging.level.as_str(),
            config.logging.level.as_str(),
            value,
        );
    }

    if let Some(storage) = section_table(document, "storage") {
        match &config.storage.database_path {
            Some(path) => set_table_scalar_if_changed(
                storage,
                "database_path",
                previous.storage.database_path.as_deref(),
                Some(path.as_str()),
                |path| value(path.unwrap_or_default()),
            ),
            None => {
                storage.remove("database_path");
            }
        }
    }
}

pub fn serialize_config_with_preserved_comments(
    existing_text: &str,
    config: &Config,
) -> Result<String, ConfigError> {
    let previous = toml::from_str::<Config>(existing_text)?;
    let mut document = existing_text.parse::<DocumentMut>()?;
    write_config_to_document(&mut document, &previous, config);
    Ok(document.to_string())
}

/// Reads `path`, writing the default template first if it does not exist.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!("Wrote default config to {}", path.display());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str::<Config>(&text)?)
}

pub fn persist_config_file(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let existing_text = std::fs::read_to_string(path).ok();
    let config_text = match existing_text {
        Some(existing_text) => {
            match serialize_config_with_preserved_comments(&existing_text, config) {
                Ok(updated_text) => updated_text,
                Err(err) => {
                    warn!(
                        "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                        path.display(),
                        err
                    );
                    toml::to_string(config)?
                }
            }
        }
        None => toml::to_string(config)?,
    };

    std::fs::write(path, config_text).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Remembers the queue's shuffle and repeat preferences.
pub fn persist_playback_preferences(
    path: &Path,
    shuffle: bool,
    repeat: RepeatMode,
) -> Result<(), ConfigError> {
    let mut config = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| toml::from_str::<Config>(&text).ok())
        .unwrap_or_default();
    if config.playback.shuffle == shuffle && config.playback.repeat_mode == repeat {
        return Ok(());
    }
    config.playback.shuffle = shuffle;
    config.playback.repeat_mode = repeat;
    persist_config_file(&config, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_parses_to_default_config() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).expect("template parses");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serialize_preserves_comments_and_untouched_values() {
        let existing = r#"# my settings
[library]
folders = ["/music"] # main library

[playback]
# remember shuffle
shuffle = false
repeat_mode = "off"
"#;
        let mut config: Config = toml::from_str(existing).expect("parse");
        config.playback.shuffle = true;
        config.playback.repeat_mode = RepeatMode::All;

        let updated =
            serialize_config_with_preserved_comments(existing, &config).expect("serialize");
        assert!(updated.contains("# my settings"));
        assert!(updated.contains("# main library"));
        assert!(updated.contains("# remember shuffle"));
        assert!(updated.contains("shuffle = true"));
        assert!(updated.contains("repeat_mode = \"all\""));

        let reparsed: Config = toml::from_str(&updated).expect("reparse");
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_load_or_create_writes_template_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let config = load_or_create_config(&path).expect("create");
        assert_eq!(config, Config::default());
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            DEFAULT_CONFIG_TEMPLATE
        );

        persist_playback_preferences(&path, true, RepeatMode::One).expect("persist");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("# off, all or one"));
        let config = load_or_create_config(&path).expect("reload");
        assert!(config.playback.shuffle);
        assert_eq!(config.playback.repeat_mode, RepeatMode::One);
    }

    #[test]
    fn test_invalid_config_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[playback]\nshuffle = \"sometimes\"\n").expect("write");
        assert!(matches!(load_or_create_config(&path), Err(ConfigError::Parse(_))));
    }
}
