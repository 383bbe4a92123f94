//! SQLite persistence for playlists, liked flags and the queue restart state.
//!
//! Playlist entries and likes are keyed by track locator so they survive a
//! rebuilt index. The schema version lives in `PRAGMA user_version`; each
//! migration runs inside its own transaction.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rusqlite::{params, Connection, Transaction};

use crate::error::StoreError;
use crate::library::media_index::RestoredPlaylist;
use crate::library::model::PlaylistId;
use crate::playback::queue_engine::RestartStateStore;

const SCHEMA_VERSION: i64 = 3;

pub struct DbManager {
    conn: Connection,
}

/// `<data dir>/melodex/library.db`, creating the directory if needed.
pub fn default_database_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| StoreError::Location("could not find data directory".to_string()))?
        .join("melodex");
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).map_err(|err| {
            StoreError::Location(format!("could not create {}: {}", data_dir.display(), err))
        })?;
    }
    Ok(data_dir.join("library.db"))
}

/// Schema as first shipped. Fresh databases replay it too, so every
/// database reaches v2 through the same `track_flags` to `liked` step.
fn migrate_v1(tx: &Transaction<'_>) -> Result<(), rusqlite::Error> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS playlists (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist_id TEXT NOT NULL,
            locator TEXT NOT NULL,
            position INTEGER NOT NULL,
            added_at_ms INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (playlist_id, locator),
            FOREIGN KEY(playlist_id) REFERENCES playlists(id)
        );
        CREATE TABLE IF NOT EXISTS track_flags (
            locator TEXT PRIMARY KEY,
            liked INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn migrate_v2(tx: &Transaction<'_>) -> Result<(), rusqlite::Error> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS liked (
            locator TEXT PRIMARY KEY,
            liked_at_ms INTEGER NOT NULL DEFAULT 0
        );",
    )?;

    // Older databases kept likes as a column on track_flags.
    let has_legacy_liked_column = {
        let mut stmt = tx.prepare("PRAGMA table_info(track_flags)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut found = false;
        for column in columns {
            if column? == "liked" {
                found = true;
                break;
            }
        }
        found
    };
    if has_legacy_liked_column {
        let migrated = tx.execute(
            "INSERT OR IGNORE INTO liked (locator, liked_at_ms)
             SELECT locator, 0 FROM track_flags WHERE liked != 0",
            [],
        )?;
        tx.execute("DROP TABLE track_flags", [])?;
        info!("Migrated {} liked tracks to the liked table", migrated);
    }
    Ok(())
}

fn migrate_v3(tx: &Transaction<'_>) -> Result<(), rusqlite::Error> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS queue_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state_json TEXT NOT NULL
        );",
    )
}

impl DbManager {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!("Opening database {}", path.display());
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let mut db_manager = Self { conn };
        db_manager.migrate()?;
        Ok(db_manager)
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        let mut version = self.schema_version()?;
        while version < SCHEMA_VERSION {
            let next = version + 1;
            let tx = self.conn.transaction()?;
            match next {
                1 => migrate_v1(&tx)?,
                2 => migrate_v2(&tx)?,
                _ => migrate_v3(&tx)?,
            }
            tx.pragma_update(None, "user_version", next)?;
            tx.commit()?;
            info!("Database schema migrated to version {}", next);
            version = next;
        }
        Ok(())
    }

    pub fn create_playlist(
        &self,
        id: &PlaylistId,
        title: &str,
        created_at_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO playlists (id, title, created_at_ms) VALUES (?1, ?2, ?3)",
            params![id.as_str(), title, created_at_ms],
        )?;
        Ok(())
    }

    pub fn rename_playlist(&self, id: &PlaylistId, title: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE playlists SET title = ?1 WHERE id = ?2",
            params![title, id.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_playlist(&mut self, id: &PlaylistId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1",
            params![id.as_str()],
        )?;
        tx.execute("DELETE FROM playlists WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    /// Appends entries after the current last position. Locators already in
    /// the playlist are ignored.
    pub fn add_playlist_entries(
        &mut self,
        id: &PlaylistId,
        entries: &[(String, i64)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let mut position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) FROM playlist_tracks WHERE playlist_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO playlist_tracks (playlist_id, locator, position, added_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (locator, added_at_ms) in entries {
                position += 1;
                stmt.execute(params![id.as_str(), locator, position, added_at_ms])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_playlist_entries(
        &mut self,
        id: &PlaylistId,
        locators: &[String],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("DELETE FROM playlist_tracks WHERE playlist_id = ?1 AND locator = ?2")?;
            for locator in locators {
                stmt.execute(params![id.as_str(), locator])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes a locator from every playlist.
    pub fn remove_locator_from_playlists(&self, locator: &str) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM playlist_tracks WHERE locator = ?1",
            params![locator],
        )?)
    }

    /// Rewrites entry positions to match `locators`.
    pub fn update_positions(
        &mut self,
        id: &PlaylistId,
        locators: &[String],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE playlist_tracks SET position = ?1 WHERE playlist_id = ?2 AND locator = ?3",
            )?;
            for (position, locator) in locators.iter().enumerate() {
                stmt.execute(params![position as i64, id.as_str(), locator])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Loads every playlist with its entries in position order. Rows that
    /// cannot be decoded are skipped with a warning.
    pub fn load_playlists(&self) -> Result<Vec<RestoredPlaylist>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, created_at_ms FROM playlists ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut playlists = Vec::new();
        for row in rows {
            match row {
                Ok((id, title, created_at_ms)) => playlists.push(RestoredPlaylist {
                    id: PlaylistId::from_raw(&id),
                    title,
                    created_at_ms,
                    entries: Vec::new(),
                }),
                Err(err) => warn!(
                    "Skipping playlist row: {}",
                    StoreError::CorruptPersistedState(err.to_string())
                ),
            }
        }

        let mut entry_stmt = self.conn.prepare(
            "SELECT locator, added_at_ms FROM playlist_tracks
             WHERE playlist_id = ?1 ORDER BY position ASC",
        )?;
        for playlist in &mut playlists {
            let entries = entry_stmt.query_map(params![playlist.id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for entry in entries {
                match entry {
                    Ok((locator, _)) if locator.trim().is_empty() => {
                        warn!("Skipping playlist entry without locator in {}", playlist.id);
                    }
                    Ok(entry) => playlist.entries.push(entry),
                    Err(err) => warn!(
                        "Skipping entry of playlist {}: {}",
                        playlist.id,
                        StoreError::CorruptPersistedState(err.to_string())
                    ),
                }
            }
        }
        Ok(playlists)
    }

    pub fn set_liked(
        &self,
        locator: &str,
        liked: bool,
        liked_at_ms: i64,
    ) -> Result<(), StoreError> {
        if liked {
            self.conn.execute(
                "INSERT OR REPLACE INTO liked (locator, liked_at_ms) VALUES (?1, ?2)",
                params![locator, liked_at_ms],
            )?;
        } else {
            self.conn
                .execute("DELETE FROM liked WHERE locator = ?1", params![locator])?;
        }
        Ok(())
    }

    pub fn load_liked(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT locator, liked_at_ms FROM liked ORDER BY liked_at_ms, locator")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut liked = Vec::new();
        for row in rows {
            match row {
                Ok(entry) => liked.push(entry),
                Err(err) => warn!(
                    "Skipping liked row: {}",
                    StoreError::CorruptPersistedState(err.to_string())
                ),
            }
        }
        Ok(liked)
    }
}

impl RestartStateStore for DbManager {
    fn save_restart_state(&mut self, state_json: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO queue_state (id, state_json) VALUES (1, ?1)",
            params![state_json],
        )?;
        Ok(())
    }

    fn load_restart_state(&mut self) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state_json FROM queue_state WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => match row.get::<_, String>(0) {
                Ok(json) => Ok(Some(json)),
                Err(err) => {
                    warn!(
                        "Ignoring queue state row: {}",
                        StoreError::CorruptPersistedState(err.to_string())
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn clear_restart_state(&mut self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM queue_state", [])?;
        Ok(())
    }
}
