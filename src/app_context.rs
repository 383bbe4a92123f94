//! Shared application handles and the operations that span the library and
//! the playback queue.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::broadcast;

use crate::config_persistence;
use crate::error::{CatalogError, IndexError, QueueError};
use crate::library::catalog::{CatalogEvent, CatalogSource};
use crate::library::library_manager::{LibraryManager, ScanSummary};
use crate::library::media_index::MediaIndex;
use crate::library::model::{MediaEntity, MusicId, PlaylistId};
use crate::playback::queue::QueueTrack;
use crate::playback::queue_engine::QueueEngine;
use crate::protocol::{Message, RepeatMode};

#[derive(Clone)]
pub struct AppContext {
    pub library: Arc<LibraryManager>,
    pub queue: Arc<QueueEngine>,
    bus_sender: broadcast::Sender<Message>,
    /// `config.toml` that receives remembered shuffle and repeat choices.
    config_file: Option<PathBuf>,
}

fn queue_tracks(index: &MediaIndex, music_ids: &[MusicId]) -> Vec<QueueTrack> {
    music_ids
        .iter()
        .filter_map(|music_id| index.music(music_id).ok())
        .map(|music| QueueTrack::from_music(&music))
        .collect()
}

impl AppContext {
    pub fn new(
        library: Arc<LibraryManager>,
        queue: Arc<QueueEngine>,
        bus_sender: broadcast::Sender<Message>,
        config_file: Option<PathBuf>,
    ) -> Self {
        // Tracks resolved from an older snapshot must not re-enter the queue
        // after the catalog removed them.
        let availability = Arc::clone(&library);
        queue.set_availability_check(move |music_id| {
            availability.snapshot().contains_music(music_id)
        });
        Self {
            library,
            queue,
            bus_sender,
            config_file,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.bus_sender.subscribe()
    }

    fn drop_removed_from_queue(&self, summary: &ScanSummary) {
        for music_id in &summary.removed {
            if let Err(err) = self.queue.remove_from_queue(music_id) {
                warn!("Failed to drop {} from the queue: {}", music_id, err);
            }
        }
    }

    /// Applies catalog changes to the library; removed tracks also leave
    /// the queue. Removal is published to the index first, so a concurrent
    /// load either sees it or is pruned here.
    pub fn apply_catalog_events(&self, events: Vec<CatalogEvent>) -> ScanSummary {
        let summary = self.library.apply_catalog_events(events);
        self.drop_removed_from_queue(&summary);
        summary
    }

    pub fn scan(&self, source: &mut dyn CatalogSource) -> Result<ScanSummary, CatalogError> {
        let summary = self.library.scan_source(source)?;
        self.drop_removed_from_queue(&summary);
        Ok(summary)
    }

    fn shuffle_or_default(&self, shuffle: Option<bool>) -> bool {
        shuffle.unwrap_or_else(|| self.queue.snapshot().shuffle)
    }

    /// Replaces the queue with the given tracks. Ids unknown to the index
    /// are skipped. Without an explicit `shuffle` the queue's current mode,
    /// initially the remembered preference, is kept.
    pub fn play_collection(
        &self,
        music_ids: &[MusicId],
        start_at: Option<&MusicId>,
        shuffle: Option<bool>,
    ) -> Result<(), QueueError> {
        let tracks = queue_tracks(&self.library.snapshot(), music_ids);
        self.queue.load(tracks, start_at, self.shuffle_or_default(shuffle), false)
    }

    /// Plays every track of a folder, artist, album, genre or playlist in
    /// its natural order.
    pub fn play_entity(
        &self,
        entity: &MediaEntity,
        start_at: Option<&MusicId>,
        shuffle: Option<bool>,
    ) -> Result<(), QueueError> {
        let snapshot = self.library.snapshot();
        let tracks: Vec<QueueTrack> = snapshot
            .entity_music(entity)
            .iter()
            .map(|music| QueueTrack::from_music(music))
            .collect();
        self.queue.load(tracks, start_at, self.shuffle_or_default(shuffle), false)
    }

    pub fn play_playlist(
        &self,
        playlist_id: &PlaylistId,
        start_at: Option<&MusicId>,
        shuffle: Option<bool>,
    ) -> Result<(), QueueError> {
        let snapshot = self.library.snapshot();
        let playlist = snapshot.playlist(playlist_id).map_err(|err| match err {
            IndexError::NotFound { key, .. } => QueueError::NotFound(key),
            other => QueueError::NotFound(other.to_string()),
        })?;
        self.play_entity(&MediaEntity::Playlist(playlist), start_at, shuffle)
    }

    pub fn enqueue_next(&self, music_ids: &[MusicId]) -> Result<bool, QueueError> {
        let tracks = queue_tracks(&self.library.snapshot(), music_ids);
        self.queue.insert_next(tracks)
    }

    pub fn enqueue(&self, music_ids: &[MusicId]) -> Result<bool, QueueError> {
        let tracks = queue_tracks(&self.library.snapshot(), music_ids);
        self.queue.append_to_queue(tracks)
    }

    pub fn toggle_shuffle(&self) -> bool {
        let enabled = self.queue.switch_shuffle_mode();
        self.remember_playback_preferences();
        enabled
    }

    pub fn cycle_repeat(&self) -> RepeatMode {
        let repeat = self.queue.switch_repeat_mode();
        self.remember_playback_preferences();
        repeat
    }

    fn remember_playback_preferences(&self) {
        let Some(config_file) = &self.config_file else {
            return;
        };
        let snapshot = self.queue.snapshot();
        if let Err(err) = config_persistence::persist_playback_preferences(
            config_file,
            snapshot.shuffle,
            snapshot.repeat,
        ) {
            warn!("Failed to remember playback preferences: {}", err);
        }
    }

    /// Restores the previous session's queue against the current index.
    pub fn restore_queue(&self) -> Result<bool, QueueError> {
        let snapshot = self.library.snapshot();
        let restored = self.queue.restore(|music_id| snapshot.contains_music(music_id))?;
        if restored {
            info!("Restored queue with {} tracks", self.queue.snapshot().tracks.len());
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db_manager::DbManager;
    use crate::library::catalog::TrackRecord;
    use crate::playback::player::LoggingPlayer;
    use crate::playback::queue_engine::QueueSettings;
    use crate::protocol::PlaybackState;

    fn record(locator: &str, title: &str, album: &str) -> TrackRecord {
        TrackRecord {
            locator: locator.to_string(),
            title: Some(title.to_string()),
            artist_title: Some("Artist".to_string()),
            album_title: Some(album.to_string()),
            duration_ms: Some(180_000),
            ..TrackRecord::default()
        }
    }

    fn context(config_file: Option<PathBuf>) -> AppContext {
        context_with(config_file, QueueSettings::default())
    }

    fn context_with(config_file: Option<PathBuf>, settings: QueueSettings) -> AppContext {
        let (bus_sender, _) = broadcast::channel(1024);
        let library = LibraryManager::new(
            vec![PathBuf::from("/music")],
            DbManager::new_in_memory().expect("db"),
            bus_sender.clone(),
            100,
        );
        let queue = QueueEngine::new(
            Box::new(LoggingPlayer::default()),
            None,
            settings,
            bus_sender.clone(),
        );
        let context = AppContext::new(Arc::new(library), Arc::new(queue), bus_sender, config_file);
        context.apply_catalog_events(vec![CatalogEvent::Batch(vec![
            record("/music/a.mp3", "A", "First"),
            record("/music/b.mp3", "B", "First"),
            record("/music/c.mp3", "C", "Second"),
        ])]);
        context
    }

    fn id_of(context: &AppContext, locator: &str) -> MusicId {
        context
            .library
            .snapshot()
            .music_by_locator(locator)
            .expect("music")
            .id
            .clone()
    }

    #[test]
    fn test_play_collection_skips_unknown_ids() {
        let context = context(None);
        let a = id_of(&context, "/music/a.mp3");
        let b = id_of(&context, "/music/b.mp3");
        let ids = [a.clone(), MusicId::from_raw("missing"), b.clone()];
        context
            .play_collection(&ids, Some(&b), Some(false))
            .expect("load");
        let snapshot = context.queue.snapshot();
        assert_eq!(snapshot.tracks, vec![a, b.clone()]);
        assert_eq!(snapshot.current_music(), Some(&b));
        assert_eq!(snapshot.state, PlaybackState::Playing);
    }

    #[test]
    fn test_play_album_entity() {
        let context = context(None);
        let snapshot = context.library.snapshot();
        let album = snapshot.album_by_title("Artist", "First").expect("album");
        context
            .play_entity(&MediaEntity::Album(album), None, Some(false))
            .expect("load");
        assert_eq!(context.queue.snapshot().tracks.len(), 2);
    }

    #[test]
    fn test_catalog_removal_leaves_queue() {
        let context = context(None);
        let a = id_of(&context, "/music/a.mp3");
        let b = id_of(&context, "/music/b.mp3");
        context
            .play_collection(&[a.clone(), b.clone()], None, Some(false))
            .expect("load");
        context.apply_catalog_events(vec![CatalogEvent::Remove {
            locator: "/music/a.mp3".to_string(),
        }]);
        let snapshot = context.queue.snapshot();
        assert_eq!(snapshot.tracks, vec![b.clone()]);
        assert_eq!(snapshot.current_music(), Some(&b));
    }

    #[test]
    fn test_tracks_resolved_before_a_removal_stay_out_of_the_queue() {
        let context = context(None);
        let a = id_of(&context, "/music/a.mp3");
        let b = id_of(&context, "/music/b.mp3");
        let stale = context.library.snapshot();
        context.apply_catalog_events(vec![CatalogEvent::Remove {
            locator: "/music/a.mp3".to_string(),
        }]);

        let tracks = queue_tracks(&stale, &[a.clone(), b.clone()]);
        assert_eq!(tracks.len(), 2);
        context
            .queue
            .load(tracks, Some(&a), false, false)
            .expect("load");
        let snapshot = context.queue.snapshot();
        assert_eq!(snapshot.tracks, vec![b.clone()]);
        assert_eq!(snapshot.current_music(), Some(&b));

        let appended = context
            .queue
            .append_to_queue(queue_tracks(&stale, &[a.clone()]))
            .expect("append");
        assert!(!appended);
        assert!(matches!(
            context.queue.load(queue_tracks(&stale, &[a]), None, false, false),
            Err(QueueError::InvalidState(_))
        ));
        assert_eq!(context.queue.snapshot().tracks, vec![b]);
    }

    #[test]
    fn test_play_without_shuffle_choice_keeps_remembered_mode() {
        let settings = QueueSettings {
            shuffle: true,
            ..QueueSettings::default()
        };
        let context = context_with(None, settings);
        let a = id_of(&context, "/music/a.mp3");
        let b = id_of(&context, "/music/b.mp3");
        let c = id_of(&context, "/music/c.mp3");

        context
            .play_collection(&[a.clone(), b, c], Some(&a), None)
            .expect("load");
        let snapshot = context.queue.snapshot();
        assert!(snapshot.shuffle);
        assert_eq!(snapshot.current_music(), Some(&a));

        context.play_collection(&[a], None, Some(false)).expect("load");
        assert!(!context.queue.snapshot().shuffle);
    }

    #[test]
    fn test_unknown_playlist_is_not_found() {
        let context = context(None);
        assert!(matches!(
            context.play_playlist(&PlaylistId::from_raw("nope"), None, Some(false)),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_toggles_remember_preferences() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        config_persistence::load_or_create_config(&path).expect("config");
        let context = context(Some(path.clone()));

        assert!(context.toggle_shuffle());
        assert_eq!(context.cycle_repeat(), RepeatMode::All);

        let config: Config = config_persistence::load_or_create_config(&path).expect("reload");
        assert!(config.playback.shuffle);
        assert_eq!(config.playback.repeat_mode, RepeatMode::All);
    }
}
