//! Library indexing runtime component.
//!
//! The manager is the single writer of the media index. Readers take an
//! `Arc` snapshot that is republished after every committed mutation, so a
//! reader never observes a half-applied change and never blocks the writer
//! for longer than a pointer swap.
//!
//! Playlist and like mutations are staged on a copy of the index, written
//! to the store and only then committed, so a storage failure leaves the
//! index untouched.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::db_manager::DbManager;
use crate::error::{CatalogError, IndexError, StoreError};
use crate::library::catalog::{CatalogEvent, CatalogSource, TrackRecord};
use crate::library::media_index::{unix_now_ms, MediaIndex, UpsertOutcome};
use crate::library::model::{MusicId, Playlist, PlaylistId};
use crate::protocol::{LibraryMessage, Message};

/// Changes applied by one catalog pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    /// Ids of tracks removed from the index.
    pub removed: Vec<MusicId>,
}

struct LibraryState {
    index: MediaIndex,
    db_manager: DbManager,
}

/// Owns the media index and its persistent state.
pub struct LibraryManager {
    state: Mutex<LibraryState>,
    snapshot: RwLock<Arc<MediaIndex>>,
    bus_producer: Sender<Message>,
    scan_batch_size: usize,
}

impl LibraryManager {
    pub fn new(
        library_roots: Vec<PathBuf>,
        db_manager: DbManager,
        bus_producer: Sender<Message>,
        scan_batch_size: usize,
    ) -> Self {
        let index = MediaIndex::new(library_roots);
        Self {
            snapshot: RwLock::new(Arc::new(index.clone())),
            state: Mutex::new(LibraryState { index, db_manager }),
            bus_producer,
            scan_batch_size: scan_batch_size.max(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LibraryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest committed index. The returned snapshot never changes.
    pub fn snapshot(&self) -> Arc<MediaIndex> {
        match self.snapshot.read() {
            Ok(snapshot) => Arc::clone(&snapshot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn send(&self, message: LibraryMessage) {
        let _ = self.bus_producer.send(Message::Library(message));
    }

    fn publish_snapshot(&self, index: &MediaIndex) {
        let published = {
            let mut snapshot = self
                .snapshot
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if snapshot.version() == index.version() {
                false
            } else {
                *snapshot = Arc::new(index.clone());
                true
            }
        };
        if published {
            debug!("Published index snapshot v{}", index.version());
            self.send(LibraryMessage::IndexChanged {
                version: index.version(),
            });
        }
    }

    // Applies `apply` to a staged copy, persists the result and commits.
    fn stage<T, A, P>(&self, apply: A, persist: P) -> Result<T, IndexError>
    where
        A: FnOnce(&mut MediaIndex) -> Result<T, IndexError>,
        P: FnOnce(&mut DbManager, &MediaIndex, &T) -> Result<(), StoreError>,
    {
        let mut state = self.lock_state();
        let mut staged = state.index.clone();
        let result = apply(&mut staged)?;
        persist(&mut state.db_manager, &staged, &result)?;
        state.index = staged;
        self.publish_snapshot(&state.index);
        Ok(result)
    }

    /// Loads liked flags and playlists from the store. Playlist entries for
    /// tracks missing from the index are pruned here and in the store.
    /// Returns the number of pruned entries.
    pub fn restore_persisted_state(&self) -> Result<usize, IndexError> {
        let mut state = self.lock_state();
        let liked = state.db_manager.load_liked()?;
        let playlists = state.db_manager.load_playlists()?;

        let mut staged = state.index.clone();
        staged.restore_liked(&liked);
        let mut pruned_total = 0;
        let mut restored_ids = Vec::with_capacity(playlists.len());
        for playlist in playlists {
            let id = playlist.id.clone();
            match staged.restore_playlist(playlist) {
                Ok(pruned) => {
                    if !pruned.is_empty() {
                        info!("Pruned {} missing tracks from playlist {}", pruned.len(), id);
                        state.db_manager.remove_playlist_entries(&id, &pruned)?;
                        pruned_total += pruned.len();
                    }
                    restored_ids.push(id);
                }
                Err(err) => warn!("Skipping stored playlist {}: {}", id, err),
            }
        }
        state.index = staged;
        info!(
            "Restored {} playlists and {} liked tracks",
            restored_ids.len(),
            liked.len()
        );
        self.publish_snapshot(&state.index);
        drop(state);
        self.send(LibraryMessage::PlaylistsChanged {
            playlist_ids: restored_ids,
        });
        Ok(pruned_total)
    }

    /// Applies catalog events in batches, publishing a snapshot after each
    /// batch.
    pub fn apply_catalog_events(&self, events: Vec<CatalogEvent>) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let mut pending: Vec<CatalogEvent> = Vec::new();
        for event in events {
            match event {
                CatalogEvent::Batch(records) => {
                    for chunk in records.chunks(self.scan_batch_size) {
                        self.apply_records(chunk, &mut summary);
                    }
                }
                other => {
                    pending.push(other);
                    if pending.len() >= self.scan_batch_size {
                        self.apply_incremental(std::mem::take(&mut pending), &mut summary);
                    }
                }
            }
        }
        if !pending.is_empty() {
            self.apply_incremental(pending, &mut summary);
        }
        summary
    }

    fn apply_records(&self, records: &[TrackRecord], summary: &mut ScanSummary) {
        let mut state = self.lock_state();
        let batch = state.index.apply_batch(records);
        summary.inserted += batch.inserted;
        summary.updated += batch.updated;
        summary.unchanged += batch.unchanged;
        summary.rejected += batch.rejected;
        self.publish_snapshot(&state.index);
    }

    fn apply_incremental(&self, events: Vec<CatalogEvent>, summary: &mut ScanSummary) {
        let mut state = self.lock_state();
        let mut changed_playlists: Vec<PlaylistId> = Vec::new();
        for event in events {
            match event {
                CatalogEvent::Upsert(record) => match state.index.upsert_music(&record) {
                    Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                    Ok(UpsertOutcome::Updated) => summary.updated += 1,
                    Ok(UpsertOutcome::Unchanged) => summary.unchanged += 1,
                    Err(err) => {
                        debug!("Skipping catalog record: {}", err);
                        summary.rejected += 1;
                    }
                },
                CatalogEvent::Remove { locator } => {
                    let removed = match state.index.remove_music_by_locator(&locator) {
                        Ok(removed) => removed,
                        Err(err) => {
                            debug!("Ignoring removal: {}", err);
                            continue;
                        }
                    };
                    if !removed.playlists.is_empty() {
                        if let Err(err) = state.db_manager.remove_locator_from_playlists(&locator) {
                            warn!("Failed to drop {} from stored playlists: {}", locator, err);
                        }
                        changed_playlists.extend(removed.playlists);
                    }
                    summary.removed.push(removed.music.id.clone());
                }
                CatalogEvent::Batch(records) => {
                    let batch = state.index.apply_batch(&records);
                    summary.inserted += batch.inserted;
                    summary.updated += batch.updated;
                    summary.unchanged += batch.unchanged;
                    summary.rejected += batch.rejected;
                }
            }
        }
        self.publish_snapshot(&state.index);
        drop(state);
        if !changed_playlists.is_empty() {
            changed_playlists.sort();
            changed_playlists.dedup();
            self.send(LibraryMessage::PlaylistsChanged {
                playlist_ids: changed_playlists,
            });
        }
    }

    /// Runs one scan of `source` and applies its events.
    pub fn scan_source(&self, source: &mut dyn CatalogSource) -> Result<ScanSummary, CatalogError> {
        let name = source.name().to_string();
        self.send(LibraryMessage::ScanStarted {
            source: name.clone(),
        });
        let events = match source.scan() {
            Ok(events) => events,
            Err(err) => {
                warn!("Scan of {} failed: {}", name, err);
                self.send(LibraryMessage::ScanFailed {
                    source: name,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };
        let summary = self.apply_catalog_events(events);
        info!(
            "Scan of {} done: {} inserted, {} updated, {} removed, {} rejected",
            name,
            summary.inserted,
            summary.updated,
            summary.removed.len(),
            summary.rejected
        );
        self.send(LibraryMessage::ScanCompleted {
            source: name,
            inserted: summary.inserted,
            updated: summary.updated,
            removed: summary.removed.len(),
        });
        Ok(summary)
    }

    pub fn create_playlist(&self, title: &str) -> Result<PlaylistId, IndexError> {
        let id = self.stage(
            |index| {
                let title = index.check_playlist_title(title, None)?;
                let playlist = Playlist {
                    id: PlaylistId::generate(),
                    title,
                    created_at_ms: unix_now_ms(),
                    entries: Vec::new(),
                };
                let id = playlist.id.clone();
                index.insert_playlist(playlist);
                Ok(id)
            },
            |db, index, id| {
                let playlist = index
                    .playlist(id)
                    .map_err(|err| StoreError::CorruptPersistedState(err.to_string()))?;
                db.create_playlist(id, &playlist.title, playlist.created_at_ms)
            },
        )?;
        self.send(LibraryMessage::PlaylistsChanged {
            playlist_ids: vec![id.clone()],
        });
        Ok(id)
    }

    pub fn rename_playlist(&self, id: &PlaylistId, title: &str) -> Result<(), IndexError> {
        self.stage(
            |index| index.rename_playlist(id, title),
            |db, index, _| match index.playlist(id) {
                Ok(playlist) => db.rename_playlist(id, &playlist.title),
                Err(_) => Ok(()),
            },
        )?;
        self.send(LibraryMessage::PlaylistsChanged {
            playlist_ids: vec![id.clone()],
        });
        Ok(())
    }

    pub fn delete_playlist(&self, id: &PlaylistId) -> Result<(), IndexError> {
        if id.is_likes() {
            return Err(IndexError::InvalidInput(
                "the Likes playlist cannot be deleted".to_string(),
            ));
        }
        self.stage(|index| index.delete_playlist(id), |db, _, _| db.delete_playlist(id))?;
        self.send(LibraryMessage::PlaylistsChanged {
            playlist_ids: vec![id.clone()],
        });
        Ok(())
    }

    /// Adds tracks to a playlist (or likes them for the Likes playlist) and
    /// returns the ids actually added.
    pub fn add_to_playlist(
        &self,
        id: &PlaylistId,
        music_ids: &[MusicId],
    ) -> Result<Vec<MusicId>, IndexError> {
        if id.is_likes() {
            let mut added = Vec::new();
            for music_id in music_ids {
                if self.set_liked(music_id, true)? {
                    added.push(music_id.clone());
                }
            }
            return Ok(added);
        }
        let added = self.stage(
            |index| index.add_music_to_playlist(id, music_ids),
            |db, index, added| {
                let Ok(playlist) = index.playlist(id) else {
                    return Ok(());
                };
                let entries: Vec<(String, i64)> = playlist
                    .entries
                    .iter()
                    .filter(|entry| added.contains(&entry.music_id))
                    .filter_map(|entry| {
                        index
                            .music(&entry.music_id)
                            .ok()
                            .map(|music| (music.locator.clone(), entry.added_at_ms))
                    })
                    .collect();
                db.add_playlist_entries(id, &entries)
            },
        )?;
        if !added.is_empty() {
            self.send(LibraryMessage::PlaylistsChanged {
                playlist_ids: vec![id.clone()],
            });
        }
        Ok(added)
    }

    pub fn remove_from_playlist(
        &self,
        id: &PlaylistId,
        music_ids: &[MusicId],
    ) -> Result<Vec<MusicId>, IndexError> {
        if id.is_likes() {
            let mut removed = Vec::new();
            for music_id in music_ids {
                if self.snapshot().contains_music(music_id) && self.set_liked(music_id, false)? {
                    removed.push(music_id.clone());
                }
            }
            return Ok(removed);
        }
        let removed = self.stage(
            |index| {
                let locators: Vec<(MusicId, String)> = music_ids
                    .iter()
                    .filter_map(|music_id| {
                        index
                            .music(music_id)
                            .ok()
                            .map(|music| (music_id.clone(), music.locator.clone()))
                    })
                    .collect();
                let removed = index.remove_music_from_playlist(id, music_ids)?;
                Ok((removed, locators))
            },
            |db, _, (removed, locators)| {
                let locators: Vec<String> = locators
                    .iter()
                    .filter(|(music_id, _)| removed.contains(music_id))
                    .map(|(_, locator)| locator.clone())
                    .collect();
                db.remove_playlist_entries(id, &locators)
            },
        )?
        .0;
        if !removed.is_empty() {
            self.send(LibraryMessage::PlaylistsChanged {
                playlist_ids: vec![id.clone()],
            });
        }
        Ok(removed)
    }

    pub fn move_playlist_entry(
        &self,
        id: &PlaylistId,
        from: usize,
        to: usize,
    ) -> Result<bool, IndexError> {
        let moved = self.stage(
            |index| index.move_playlist_entry(id, from, to),
            |db, index, moved| {
                if !*moved {
                    return Ok(());
                }
                let Ok(playlist) = index.playlist(id) else {
                    return Ok(());
                };
                let locators: Vec<String> = playlist
                    .entries
                    .iter()
                    .filter_map(|entry| index.music(&entry.music_id).ok())
                    .map(|music| music.locator.clone())
                    .collect();
                db.update_positions(id, &locators)
            },
        )?;
        if moved {
            self.send(LibraryMessage::PlaylistsChanged {
                playlist_ids: vec![id.clone()],
            });
        }
        Ok(moved)
    }

    /// Sets the liked flag of a track. Returns whether it changed.
    pub fn set_liked(&self, music_id: &MusicId, liked: bool) -> Result<bool, IndexError> {
        let changed = self.stage(
            |index| index.set_liked(music_id, liked),
            |db, index, changed| {
                if !*changed {
                    return Ok(());
                }
                match index.music(music_id) {
                    Ok(music) => db.set_liked(&music.locator, liked, unix_now_ms()),
                    Err(_) => Ok(()),
                }
            },
        )?;
        if changed {
            self.send(LibraryMessage::LikedChanged {
                music_id: music_id.clone(),
                liked,
            });
        }
        Ok(changed)
    }
}
