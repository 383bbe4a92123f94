//! Music library indexing and playback queue core.

pub mod app_context;
pub mod compare;
pub mod config;
pub mod config_persistence;
pub mod db_manager;
pub mod error;
pub mod library;
pub mod media_file_discovery;
pub mod metadata_tags;
pub mod playback;
pub mod protocol;
pub mod services;
