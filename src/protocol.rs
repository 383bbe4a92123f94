//! Event-bus protocol shared by all runtime components.
//!
//! The library manager and the queue engine publish notifications on a
//! `tokio::sync::broadcast` bus; front ends subscribe and re-read whatever
//! snapshot they render.

use crate::library::model::{MusicId, PlaylistId};

/// Repeat behavior applied when navigating beyond the current track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off, // Stop after the last track
    All, // Wrap around to the first track
    One, // Repeat the current track
}

impl RepeatMode {
    /// Cycles OFF -> ALL -> ONE -> OFF.
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::All,
            Self::All => Self::One,
            Self::One => Self::Off,
        }
    }
}

/// Playback lifecycle of the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Empty,
    /// A track is loaded but playback has not started.
    Loaded,
    Playing,
    Paused,
    /// The end of the queue was reached with repeat off.
    Finished,
}

/// Immutable view of the queue handed to observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueSnapshot {
    /// Bumped on every queue change.
    pub version: u64,
    /// Tracks in active (possibly shuffled) order.
    pub tracks: Vec<MusicId>,
    pub current: Option<usize>,
    pub state: PlaybackState,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub position_ms: u64,
}

impl QueueSnapshot {
    pub fn current_music(&self) -> Option<&MusicId> {
        self.current.and_then(|index| self.tracks.get(index))
    }
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Library(LibraryMessage),
    Queue(QueueMessage),
}

/// Library-domain notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum LibraryMessage {
    /// A new index snapshot was published.
    IndexChanged { version: u64 },
    PlaylistsChanged { playlist_ids: Vec<PlaylistId> },
    LikedChanged { music_id: MusicId, liked: bool },
    ScanStarted { source: String },
    ScanCompleted {
        source: String,
        inserted: usize,
        updated: usize,
        removed: usize,
    },
    ScanFailed { source: String, reason: String },
}

/// Queue-domain notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    StateChanged(QueueSnapshot),
    TrackStarted { music_id: MusicId, index: usize },
    QueueFinished,
    PlayerError { music_id: MusicId, reason: String },
    PositionChanged { music_id: MusicId, position_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_mode_cycles_through_all_modes() {
        assert_eq!(RepeatMode::Off.next(), RepeatMode::All);
        assert_eq!(RepeatMode::All.next(), RepeatMode::One);
        assert_eq!(RepeatMode::One.next(), RepeatMode::Off);
    }

    #[test]
    fn test_snapshot_current_music_handles_empty_queue() {
        let snapshot = QueueSnapshot::default();
        assert_eq!(snapshot.current_music(), None);
        let snapshot = QueueSnapshot {
            tracks: vec![MusicId::from_raw("a"), MusicId::from_raw("b")],
            current: Some(1),
            ..QueueSnapshot::default()
        };
        assert_eq!(snapshot.current_music(), Some(&MusicId::from_raw("b")));
    }
}
