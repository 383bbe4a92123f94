//! Seam between the queue engine and an audio output.

/// Identifies one `load_track` call. Events carrying an older token refer
/// to a track the engine has already moved past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PlaybackToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEventKind {
    /// The track played to its end.
    Ended,
    /// The track could not be opened or decoded.
    Error(String),
    Position(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEvent {
    pub token: PlaybackToken,
    pub kind: PlayerEventKind,
}

impl PlayerEvent {
    pub fn ended(token: PlaybackToken) -> Self {
        Self {
            token,
            kind: PlayerEventKind::Ended,
        }
    }

    pub fn error(token: PlaybackToken, reason: impl Into<String>) -> Self {
        Self {
            token,
            kind: PlayerEventKind::Error(reason.into()),
        }
    }

    pub fn position(token: PlaybackToken, position_ms: u64) -> Self {
        Self {
            token,
            kind: PlayerEventKind::Position(position_ms),
        }
    }
}

/// Audio output driven by the queue engine. The engine serializes every
/// call; implementations report progress through [`PlayerEvent`]s tagged
/// with the token passed to `load_track`.
pub trait Player: Send {
    /// Prepares `locator` for playback without starting it.
    fn load_track(&mut self, token: PlaybackToken, locator: &str) -> Result<(), String>;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position_ms: u64);
    fn stop(&mut self);
}

/// Player that only logs calls; used by the headless binary.
#[derive(Debug, Default)]
pub struct LoggingPlayer {
    loaded: Option<(PlaybackToken, String)>,
}

impl LoggingPlayer {
    pub fn loaded(&self) -> Option<&(PlaybackToken, String)> {
        self.loaded.as_ref()
    }
}

impl Player for LoggingPlayer {
    fn load_track(&mut self, token: PlaybackToken, locator: &str) -> Result<(), String> {
        log::info!("Player: load {} ({:?})", locator, token);
        self.loaded = Some((token, locator.to_string()));
        Ok(())
    }

    fn play(&mut self) {
        log::debug!("Player: play");
    }

    fn pause(&mut self) {
        log::debug!("Player: pause");
    }

    fn seek(&mut self, position_ms: u64) {
        log::debug!("Player: seek to {}ms", position_ms);
    }

    fn stop(&mut self) {
        log::debug!("Player: stop");
        self.loaded = None;
    }
}
