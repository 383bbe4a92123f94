//! Error kinds surfaced by the library index, the queue engine and storage.

use thiserror::Error;

/// Failures of the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement or could not be opened.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A stored record could not be decoded.
    #[error("corrupt persisted state: {0}")]
    CorruptPersistedState(String),
    /// The data directory could not be resolved or created.
    #[error("storage location unavailable: {0}")]
    Location(String),
}

/// Failures of media index lookups and mutations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// No entity with the given id or title exists.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    /// A playlist with the same case-insensitive title already exists.
    #[error("a playlist titled {0:?} already exists")]
    DuplicateTitle(String),
    /// A catalog record or user input was rejected before touching the index.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The mutation could not be persisted; the index was left unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IndexError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }
}

/// Failures of explicit queue commands. Transport commands (skip, seek,
/// pause) never fail on an empty queue; they report that nothing happened.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The command needs a loaded queue or non-empty track list.
    #[error("invalid queue state: {0}")]
    InvalidState(&'static str),
    /// The requested track is not part of the queue or the library.
    #[error("track not found: {0}")]
    NotFound(String),
    /// A newer load started before this one could commit.
    #[error("queue load superseded by a newer load")]
    LoadCancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures while reading a catalog source.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
}

/// Failures while loading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to edit config document: {0}")]
    Document(#[from] toml_edit::TomlError),
}
