//! Playback queue engine.
//!
//! Owns the [`Queue`] and the [`Player`] behind one mutex, so every player
//! call is serialized with the queue change that caused it. Each
//! `load_track` gets a fresh [`PlaybackToken`]; player events carrying an
//! older token are dropped.
//!
//! `load` builds its (possibly shuffled) queue outside the lock and commits
//! only if no newer load started meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;

use crate::error::{QueueError, StoreError};
use crate::library::model::MusicId;
use crate::playback::player::{Player, PlayerEvent, PlayerEventKind, PlaybackToken};
use crate::playback::queue::{Queue, QueueEntry, QueueTrack, Step};
use crate::protocol::{Message, PlaybackState, QueueMessage, QueueSnapshot, RepeatMode};

/// Persisted queue used to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct QueueRestartState {
    /// Tracks in original order.
    pub tracks: Vec<QueueTrack>,
    /// Active order as indices into `tracks`.
    pub active_order: Vec<usize>,
    pub current: Option<usize>,
    pub position_ms: u64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
}

/// Storage for the serialized restart state.
pub trait RestartStateStore: Send {
    fn save_restart_state(&mut self, state_json: &str) -> Result<(), StoreError>;
    fn load_restart_state(&mut self) -> Result<Option<String>, StoreError>;
    fn clear_restart_state(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// `skip_previous` restarts the current track past this position.
    pub previous_restart_threshold_ms: u64,
    /// Minimum spacing between restart-state writes caused by position updates.
    pub restart_state_persist_interval_ms: u64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            previous_restart_threshold_ms: 3_000,
            restart_state_persist_interval_ms: 5_000,
            shuffle: false,
            repeat: RepeatMode::Off,
        }
    }
}

/// Tells whether a track may still be queued.
pub type AvailabilityCheck = Box<dyn Fn(&MusicId) -> bool + Send>;

pub(crate) fn seeded_rng() -> StdRng {
    let mut seed = [0u8; 32];
    if let Err(err) = getrandom::fill(&mut seed) {
        warn!("Falling back to a clock-based shuffle seed: {}", err);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0);
        seed[..8].copy_from_slice(&nanos.to_le_bytes());
    }
    StdRng::from_seed(seed)
}

struct EngineState {
    queue: Queue,
    state: PlaybackState,
    position_ms: u64,
    token: PlaybackToken,
    next_token: u64,
    version: u64,
    consecutive_failures: usize,
    last_position_persist: Option<Instant>,
    rng: StdRng,
    player: Box<dyn Player>,
    store: Option<Box<dyn RestartStateStore>>,
    availability: Option<AvailabilityCheck>,
}

impl EngineState {
    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            version: self.version,
            tracks: self.queue.music_ids(),
            current: self.queue.current(),
            state: self.state,
            shuffle: self.queue.shuffle(),
            repeat: self.queue.repeat(),
            position_ms: self.position_ms,
        }
    }

    fn restart_state(&self) -> QueueRestartState {
        QueueRestartState {
            tracks: self
                .queue
                .original_entries()
                .iter()
                .map(|entry| entry.track.clone())
                .collect(),
            active_order: self.queue.active_order(),
            current: self.queue.current(),
            position_ms: self.position_ms,
            shuffle: self.queue.shuffle(),
            repeat: self.queue.repeat(),
        }
    }

    fn is_available(&self, music_id: &MusicId) -> bool {
        self.availability
            .as_ref()
            .map_or(true, |is_available| is_available(music_id))
    }

    fn next_token(&mut self) -> PlaybackToken {
        self.next_token += 1;
        self.token = PlaybackToken(self.next_token);
        self.token
    }
}

pub struct QueueEngine {
    inner: Mutex<EngineState>,
    load_generation: AtomicU64,
    bus_sender: broadcast::Sender<Message>,
    settings: QueueSettings,
}

impl QueueEngine {
    pub fn new(
        player: Box<dyn Player>,
        store: Option<Box<dyn RestartStateStore>>,
        settings: QueueSettings,
        bus_sender: broadcast::Sender<Message>,
    ) -> Self {
        let mut rng = seeded_rng();
        let mut queue = Queue::default();
        queue.set_repeat(settings.repeat);
        queue.set_shuffle(settings.shuffle, &mut rng);
        Self {
            inner: Mutex::new(EngineState {
                queue,
                state: PlaybackState::Empty,
                position_ms: 0,
                token: PlaybackToken::default(),
                next_token: 0,
                version: 0,
                consecutive_failures: 0,
                last_position_persist: None,
                rng,
                player,
                store,
                availability: None,
            }),
            load_generation: AtomicU64::new(0),
            bus_sender,
            settings,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lock_state().snapshot()
    }

    /// Installs the check applied under the engine lock whenever tracks
    /// enter the queue. Tracks that fail it are left out.
    pub fn set_availability_check<F>(&self, is_available: F)
    where
        F: Fn(&MusicId) -> bool + Send + 'static,
    {
        self.lock_state().availability = Some(Box::new(is_available));
    }

    /// Token of the most recent `load_track` call.
    pub fn current_token(&self) -> PlaybackToken {
        self.lock_state().token
    }

    fn publish(&self, message: QueueMessage) {
        let _ = self.bus_sender.send(Message::Queue(message));
    }

    /// Publishes a new snapshot and persists the restart state.
    fn commit(&self, state: &mut EngineState) {
        state.version += 1;
        self.persist(state);
        self.publish(QueueMessage::StateChanged(state.snapshot()));
    }

    fn persist(&self, state: &mut EngineState) {
        let restart_state = if state.queue.is_empty() {
            None
        } else {
            Some(state.restart_state())
        };
        let Some(store) = state.store.as_mut() else {
            return;
        };
        let result = match restart_state {
            None => store.clear_restart_state(),
            Some(restart_state) => match serde_json::to_string(&restart_state) {
                Ok(json) => store.save_restart_state(&json),
                Err(err) => {
                    warn!("Failed to encode queue restart state: {}", err);
                    return;
                }
            },
        };
        if let Err(err) = result {
            warn!("Failed to persist queue restart state: {}", err);
        }
    }

    // Loads the entry at `index`, skipping entries the player rejects.
    fn start_at(&self, state: &mut EngineState, index: usize, autoplay: bool) {
        let mut index = index;
        loop {
            if !state.queue.jump(index) {
                state.state = PlaybackState::Empty;
                return;
            }
            let Some(entry) = state.queue.current_entry().cloned() else {
                state.state = PlaybackState::Empty;
                return;
            };
            let token = state.next_token();
            state.position_ms = 0;
            match state.player.load_track(token, &entry.track.path_or_uri) {
                Ok(()) => {
                    if autoplay {
                        state.player.play();
                        state.state = PlaybackState::Playing;
                    } else {
                        state.state = PlaybackState::Loaded;
                    }
                    debug!("Queue: started {} at {} ({:?})", entry.track.music_id, index, token);
                    self.publish(QueueMessage::TrackStarted {
                        music_id: entry.track.music_id.clone(),
                        index,
                    });
                    return;
                }
                Err(reason) => match self.register_failure(state, &entry, reason) {
                    Some(next) => index = next,
                    None => return,
                },
            }
        }
    }

    // Returns the entry to try next, or None once playback stopped.
    fn register_failure(
        &self,
        state: &mut EngineState,
        entry: &QueueEntry,
        reason: String,
    ) -> Option<usize> {
        warn!("Queue: failed to play {}: {}", entry.track.music_id, reason);
        state.consecutive_failures += 1;
        self.publish(QueueMessage::PlayerError {
            music_id: entry.track.music_id.clone(),
            reason,
        });
        if state.consecutive_failures >= state.queue.len() {
            error!(
                "Queue: {} consecutive tracks failed, stopping playback",
                state.consecutive_failures
            );
            self.finish(state);
            return None;
        }
        match state.queue.next_step_past_current() {
            Some(Step::To(next)) => Some(next),
            _ => {
                self.finish(state);
                None
            }
        }
    }

    fn finish(&self, state: &mut EngineState) {
        state.player.stop();
        state.state = PlaybackState::Finished;
        state.position_ms = 0;
        self.publish(QueueMessage::QueueFinished);
    }

    fn begin_load(&self) -> u64 {
        self.load_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn commit_load(
        &self,
        generation: u64,
        mut queue: Queue,
        paused: bool,
    ) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        if self.load_generation.load(Ordering::SeqCst) != generation {
            debug!("Queue: load {} superseded", generation);
            return Err(QueueError::LoadCancelled);
        }
        let mut unavailable: Vec<MusicId> = queue
            .music_ids()
            .into_iter()
            .filter(|music_id| !state.is_available(music_id))
            .collect();
        unavailable.sort();
        unavailable.dedup();
        for music_id in &unavailable {
            debug!("Queue: leaving out {}, no longer in the library", music_id);
            queue.remove(music_id);
        }
        if queue.is_empty() {
            return Err(QueueError::InvalidState("none of the tracks is in the library"));
        }
        state.player.stop();
        state.queue = queue;
        state.consecutive_failures = 0;
        let start = state.queue.current().unwrap_or(0);
        self.start_at(&mut state, start, !paused);
        info!(
            "Queue: loaded {} tracks (shuffle: {}, repeat: {:?})",
            state.queue.len(),
            state.queue.shuffle(),
            state.queue.repeat()
        );
        self.commit(&mut state);
        Ok(())
    }

    /// Replaces the queue with `tracks` and loads `start_at` (or the first
    /// track). Returns `LoadCancelled` if a newer load overtook this one.
    /// Tracks failing the availability check are dropped, and a load left
    /// with none is `InvalidState`.
    pub fn load(
        &self,
        tracks: Vec<QueueTrack>,
        start_at: Option<&MusicId>,
        shuffle: bool,
        paused: bool,
    ) -> Result<(), QueueError> {
        if tracks.is_empty() {
            return Err(QueueError::InvalidState("cannot load an empty track list"));
        }
        let start_index = match start_at {
            None => 0,
            Some(music_id) => tracks
                .iter()
                .position(|track| &track.music_id == music_id)
                .ok_or_else(|| QueueError::NotFound(music_id.to_string()))?,
        };
        let generation = self.begin_load();
        let repeat = self.lock_state().queue.repeat();
        let queue = Queue::build(tracks, start_index, shuffle, repeat, &mut seeded_rng());
        self.commit_load(generation, queue, paused)
    }

    pub fn play_pause(&self) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        match state.state {
            PlaybackState::Empty => return Ok(false),
            PlaybackState::Playing => {
                state.player.pause();
                state.state = PlaybackState::Paused;
            }
            PlaybackState::Paused | PlaybackState::Loaded => {
                state.player.play();
                state.state = PlaybackState::Playing;
            }
            PlaybackState::Finished => {
                let current = state.queue.current().unwrap_or(0);
                state.consecutive_failures = 0;
                self.start_at(&mut state, current, true);
            }
        }
        self.commit(&mut state);
        Ok(true)
    }

    pub fn skip_next(&self) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        let Some(step) = state.queue.next_step() else {
            return Ok(false);
        };
        let autoplay = state.state == PlaybackState::Playing;
        match step {
            Step::To(index) => self.start_at(&mut state, index, autoplay),
            Step::Finished => self.finish(&mut state),
        }
        self.commit(&mut state);
        Ok(true)
    }

    /// Restarts the current track when it has played past the configured
    /// threshold, otherwise moves to the previous track.
    pub fn skip_previous(&self) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        let Some(step) = state.queue.previous_step() else {
            return Ok(false);
        };
        let autoplay = state.state == PlaybackState::Playing;
        if state.position_ms > self.settings.previous_restart_threshold_ms {
            state.player.seek(0);
            state.position_ms = 0;
        } else if let Step::To(index) = step {
            self.start_at(&mut state, index, autoplay);
        }
        self.commit(&mut state);
        Ok(true)
    }

    /// Seeks to `fraction` of the current track, clamped to `[0, 1]`.
    pub fn seek_to(&self, fraction: f64) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        let Some(duration_ms) = state
            .queue
            .current_entry()
            .map(|entry| entry.track.duration_ms)
        else {
            return Ok(false);
        };
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let position_ms = (duration_ms as f64 * fraction).round() as u64;
        state.player.seek(position_ms);
        state.position_ms = position_ms;
        self.commit(&mut state);
        Ok(true)
    }

    /// Toggles shuffle and returns the new value. The current track keeps
    /// playing.
    pub fn switch_shuffle_mode(&self) -> bool {
        let mut state = self.lock_state();
        let enabled = !state.queue.shuffle();
        let EngineState { queue, rng, .. } = &mut *state;
        queue.set_shuffle(enabled, rng);
        self.commit(&mut state);
        enabled
    }

    /// Cycles OFF -> ALL -> ONE -> OFF and returns the new mode.
    pub fn switch_repeat_mode(&self) -> RepeatMode {
        let mut state = self.lock_state();
        let repeat = state.queue.repeat().next();
        state.queue.set_repeat(repeat);
        self.commit(&mut state);
        repeat
    }

    /// Removes every queue entry of `music_id`.
    pub fn remove_from_queue(&self, music_id: &MusicId) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        let was_playing = state.state == PlaybackState::Playing;
        let removal = state.queue.remove(music_id);
        if removal.removed == 0 {
            return Ok(false);
        }
        if state.queue.is_empty() {
            state.player.stop();
            state.state = PlaybackState::Empty;
            state.position_ms = 0;
        } else if removal.current_removed {
            if removal.ran_off_end {
                self.finish(&mut state);
            } else if let Some(current) = state.queue.current() {
                self.start_at(&mut state, current, was_playing);
            }
        }
        self.commit(&mut state);
        Ok(true)
    }

    /// Inserts tracks right after the current one.
    pub fn insert_next(&self, tracks: Vec<QueueTrack>) -> Result<bool, QueueError> {
        self.extend(tracks, true)
    }

    pub fn append_to_queue(&self, tracks: Vec<QueueTrack>) -> Result<bool, QueueError> {
        self.extend(tracks, false)
    }

    fn extend(&self, tracks: Vec<QueueTrack>, next: bool) -> Result<bool, QueueError> {
        if tracks.is_empty() {
            return Ok(false);
        }
        let mut state = self.lock_state();
        let tracks: Vec<QueueTrack> = tracks
            .into_iter()
            .filter(|track| state.is_available(&track.music_id))
            .collect();
        if tracks.is_empty() {
            return Ok(false);
        }
        let was_empty = state.queue.is_empty();
        if next {
            state.queue.insert_next(tracks);
        } else {
            state.queue.append(tracks);
        }
        if was_empty {
            self.start_at(&mut state, 0, false);
        }
        self.commit(&mut state);
        Ok(true)
    }

    /// Starts playback of the entry at `index` in active order.
    pub fn play_index(&self, index: usize) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        if state.queue.is_empty() {
            return Err(QueueError::InvalidState("queue is empty"));
        }
        if index >= state.queue.len() {
            return Err(QueueError::NotFound(format!("queue index {index}")));
        }
        state.consecutive_failures = 0;
        self.start_at(&mut state, index, true);
        self.commit(&mut state);
        Ok(())
    }

    /// Starts playback of the first queue entry of `music_id`.
    pub fn play_music(&self, music_id: &MusicId) -> Result<(), QueueError> {
        let index = {
            let state = self.lock_state();
            if state.queue.is_empty() {
                return Err(QueueError::InvalidState("queue is empty"));
            }
            state
                .queue
                .position_of(music_id)
                .ok_or_else(|| QueueError::NotFound(music_id.to_string()))?
        };
        self.play_index(index)
    }

    pub fn move_entry(&self, from: usize, to: usize) -> Result<bool, QueueError> {
        let mut state = self.lock_state();
        if !state.queue.move_entry(from, to) {
            return Ok(false);
        }
        self.commit(&mut state);
        Ok(true)
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.player.stop();
        state.queue.clear();
        state.state = PlaybackState::Empty;
        state.position_ms = 0;
        self.commit(&mut state);
    }

    /// Feeds a player event into the engine. Returns false for events
    /// belonging to an earlier `load_track` call.
    pub fn handle_player_event(&self, event: PlayerEvent) -> bool {
        let mut state = self.lock_state();
        if event.token != state.token {
            debug!(
                "Queue: dropping stale player event {:?} (current {:?})",
                event, state.token
            );
            return false;
        }
        match event.kind {
            PlayerEventKind::Ended => {
                state.consecutive_failures = 0;
                match state.queue.next_step() {
                    Some(Step::To(index)) => self.start_at(&mut state, index, true),
                    Some(Step::Finished) => self.finish(&mut state),
                    None => return false,
                }
                self.commit(&mut state);
            }
            PlayerEventKind::Error(reason) => {
                let Some(entry) = state.queue.current_entry().cloned() else {
                    return false;
                };
                let autoplay = state.state == PlaybackState::Playing;
                if let Some(next) = self.register_failure(&mut state, &entry, reason) {
                    self.start_at(&mut state, next, autoplay);
                }
                self.commit(&mut state);
            }
            PlayerEventKind::Position(position_ms) => {
                state.consecutive_failures = 0;
                state.position_ms = position_ms;
                if let Some(entry) = state.queue.current_entry() {
                    self.publish(QueueMessage::PositionChanged {
                        music_id: entry.track.music_id.clone(),
                        position_ms,
                    });
                }
                let interval =
                    Duration::from_millis(self.settings.restart_state_persist_interval_ms);
                let due = state
                    .last_position_persist
                    .map(|last| last.elapsed() >= interval)
                    .unwrap_or(true);
                if due {
                    state.last_position_persist = Some(Instant::now());
                    self.persist(&mut state);
                }
            }
        }
        true
    }

    /// Reloads the persisted queue, paused at the stored position. Tracks
    /// for which `is_available` is false are dropped first. Returns whether
    /// a queue was restored.
    pub fn restore<F>(&self, is_available: F) -> Result<bool, QueueError>
    where
        F: Fn(&MusicId) -> bool,
    {
        let mut state = self.lock_state();
        let Some(store) = state.store.as_mut() else {
            return Ok(false);
        };
        let Some(json) = store.load_restart_state()? else {
            return Ok(false);
        };
        let restored: QueueRestartState = match serde_json::from_str(&json) {
            Ok(restored) => restored,
            Err(err) => {
                let err = StoreError::CorruptPersistedState(format!("queue restart state: {err}"));
                warn!("Dropping queue restart state: {}", err);
                store.clear_restart_state()?;
                return Ok(false);
            }
        };

        let mut queue = Queue::from_parts(
            restored.tracks,
            &restored.active_order,
            restored.current,
            restored.shuffle,
            restored.repeat,
        );
        let mut missing: Vec<MusicId> = queue
            .entries()
            .iter()
            .map(|entry| entry.track.music_id.clone())
            .filter(|music_id| !is_available(music_id))
            .collect();
        missing.sort();
        missing.dedup();
        let mut current_kept = true;
        for music_id in &missing {
            current_kept &= !queue.remove(music_id).current_removed;
        }
        if !missing.is_empty() {
            info!("Queue: dropped {} unavailable tracks on restore", missing.len());
        }

        state.queue = queue;
        state.consecutive_failures = 0;
        if state.queue.is_empty() {
            state.state = PlaybackState::Empty;
            self.commit(&mut state);
            return Ok(false);
        }
        let current = state.queue.current().unwrap_or(0);
        self.start_at(&mut state, current, false);
        if current_kept && restored.position_ms > 0 && state.state == PlaybackState::Loaded {
            state.player.seek(restored.position_ms);
            state.position_ms = restored.position_ms;
        }
        info!(
            "Queue: restored {} tracks at {:?}",
            state.queue.len(),
            state.queue.current()
        );
        self.commit(&mut state);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPlayer {
        calls: Arc<Mutex<Vec<String>>>,
        failing: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingPlayer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn fail_on(&self, path: &str) {
            self.failing.lock().expect("failing").push(path.to_string());
        }
    }

    impl Player for RecordingPlayer {
        fn load_track(&mut self, _token: PlaybackToken, locator: &str) -> Result<(), String> {
            self.calls.lock().expect("calls").push(format!("load {locator}"));
            if self.failing.lock().expect("failing").iter().any(|path| path == locator) {
                return Err("unsupported format".to_string());
            }
            Ok(())
        }

        fn play(&mut self) {
            self.calls.lock().expect("calls").push("play".to_string());
        }

        fn pause(&mut self) {
            self.calls.lock().expect("calls").push("pause".to_string());
        }

        fn seek(&mut self, position_ms: u64) {
            self.calls.lock().expect("calls").push(format!("seek {position_ms}"));
        }

        fn stop(&mut self) {
            self.calls.lock().expect("calls").push("stop".to_string());
        }
    }

    #[derive(Clone, Default)]
    struct MemoryStore {
        json: Arc<Mutex<Option<String>>>,
    }

    impl RestartStateStore for MemoryStore {
        fn save_restart_state(&mut self, state_json: &str) -> Result<(), StoreError> {
            *self.json.lock().expect("store") = Some(state_json.to_string());
            Ok(())
        }

        fn load_restart_state(&mut self) -> Result<Option<String>, StoreError> {
            Ok(self.json.lock().expect("store").clone())
        }

        fn clear_restart_state(&mut self) -> Result<(), StoreError> {
            *self.json.lock().expect("store") = None;
            Ok(())
        }
    }

    fn tracks(ids: &[&str]) -> Vec<QueueTrack> {
        ids.iter()
            .map(|id| QueueTrack::new(MusicId::from_raw(id), format!("/music/{id}.mp3"), 100_000))
            .collect()
    }

    fn engine_with(
        player: &RecordingPlayer,
        store: Option<MemoryStore>,
        repeat: RepeatMode,
    ) -> (QueueEngine, broadcast::Receiver<Message>) {
        let (bus_sender, receiver) = broadcast::channel(256);
        let settings = QueueSettings {
            repeat,
            ..QueueSettings::default()
        };
        let store = store.map(|store| Box::new(store) as Box<dyn RestartStateStore>);
        (
            QueueEngine::new(Box::new(player.clone()), store, settings, bus_sender),
            receiver,
        )
    }

    fn current_id(engine: &QueueEngine) -> Option<String> {
        engine
            .snapshot()
            .current_music()
            .map(|id| id.as_str().to_string())
    }

    fn drain(receiver: &mut broadcast::Receiver<Message>) -> Vec<QueueMessage> {
        let mut messages = Vec::new();
        while let Ok(Message::Queue(message)) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_track_end_with_repeat_all_wraps_to_first() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::All);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("c")), false, false)
            .expect("load");
        assert!(engine.handle_player_event(PlayerEvent::ended(engine.current_token())));
        assert_eq!(current_id(&engine).as_deref(), Some("a"));
        assert_eq!(engine.snapshot().state, PlaybackState::Playing);
    }

    #[test]
    fn test_track_end_with_repeat_off_finishes_on_last_track() {
        let player = RecordingPlayer::default();
        let (engine, mut receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("c")), false, false)
            .expect("load");
        drain(&mut receiver);
        engine.handle_player_event(PlayerEvent::ended(engine.current_token()));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Finished);
        assert_eq!(current_id(&engine).as_deref(), Some("c"));
        assert!(drain(&mut receiver).contains(&QueueMessage::QueueFinished));
        assert_eq!(player.calls().last().map(String::as_str), Some("stop"));
    }

    #[test]
    fn test_skip_next_at_end_depends_on_repeat() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::All);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("c")), false, false)
            .expect("load");
        assert!(engine.skip_next().expect("skip"));
        assert_eq!(current_id(&engine).as_deref(), Some("a"));
        assert_eq!(engine.snapshot().state, PlaybackState::Playing);

        let player = RecordingPlayer::default();
        let (engine, mut receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("c")), false, false)
            .expect("load");
        drain(&mut receiver);
        assert!(engine.skip_next().expect("skip"));
        assert_eq!(engine.snapshot().state, PlaybackState::Finished);
        assert_eq!(current_id(&engine).as_deref(), Some("c"));
        assert!(drain(&mut receiver).contains(&QueueMessage::QueueFinished));
        assert_eq!(player.calls().last().map(String::as_str), Some("stop"));
    }

    #[test]
    fn test_repeat_one_reloads_same_track() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::One);
        engine.load(tracks(&["a", "b"]), None, false, false).expect("load");
        engine.handle_player_event(PlayerEvent::ended(engine.current_token()));
        assert_eq!(current_id(&engine).as_deref(), Some("a"));
        engine.skip_next().expect("skip");
        assert_eq!(current_id(&engine).as_deref(), Some("a"));
        let loads = player.calls().iter().filter(|call| call.starts_with("load")).count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_stale_track_end_is_ignored() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.load(tracks(&["a", "b", "c"]), None, false, false).expect("load");
        let stale = engine.current_token();
        engine.skip_next().expect("skip");
        assert_eq!(current_id(&engine).as_deref(), Some("b"));

        assert!(!engine.handle_player_event(PlayerEvent::ended(stale)));
        assert_eq!(current_id(&engine).as_deref(), Some("b"));
        assert!(!engine.handle_player_event(PlayerEvent::position(stale, 5_000)));
        assert_eq!(engine.snapshot().position_ms, 0);
    }

    #[test]
    fn test_superseded_load_is_cancelled() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        let first = engine.begin_load();
        let second = engine.begin_load();
        let queue = |ids: &[&str]| {
            Queue::build(tracks(ids), 0, false, RepeatMode::Off, &mut seeded_rng())
        };

        let result = engine.commit_load(first, queue(&["old"]), false);
        assert!(matches!(result, Err(QueueError::LoadCancelled)));
        engine.commit_load(second, queue(&["new"]), false).expect("latest load");
        assert_eq!(current_id(&engine).as_deref(), Some("new"));
        assert!(!player.calls().contains(&"load /music/old.mp3".to_string()));
    }

    #[test]
    fn test_load_validates_input() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        assert!(matches!(
            engine.load(Vec::new(), None, false, false),
            Err(QueueError::InvalidState(_))
        ));
        assert!(matches!(
            engine.load(tracks(&["a"]), Some(&MusicId::from_raw("zzz")), false, false),
            Err(QueueError::NotFound(_))
        ));
        assert_eq!(engine.snapshot().state, PlaybackState::Empty);
    }

    #[test]
    fn test_transport_on_empty_queue_is_a_no_op() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        assert!(!engine.play_pause().expect("play_pause"));
        assert!(!engine.skip_next().expect("next"));
        assert!(!engine.skip_previous().expect("previous"));
        assert!(!engine.seek_to(0.5).expect("seek"));
        assert!(!engine.remove_from_queue(&MusicId::from_raw("a")).expect("remove"));
        assert!(matches!(engine.play_index(0), Err(QueueError::InvalidState(_))));
        assert!(player.calls().is_empty());
    }

    #[test]
    fn test_shuffle_load_starts_with_requested_track() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b", "c", "d"]), Some(&MusicId::from_raw("c")), true, true)
            .expect("load");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.current, Some(0));
        assert_eq!(current_id(&engine).as_deref(), Some("c"));
        assert_eq!(snapshot.state, PlaybackState::Loaded);
        assert!(snapshot.shuffle);
        assert!(!player.calls().contains(&"play".to_string()));
    }

    #[test]
    fn test_play_pause_toggles_between_playing_and_paused() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.load(tracks(&["a"]), None, false, true).expect("load");
        assert_eq!(engine.snapshot().state, PlaybackState::Loaded);
        engine.play_pause().expect("play");
        assert_eq!(engine.snapshot().state, PlaybackState::Playing);
        engine.play_pause().expect("pause");
        assert_eq!(engine.snapshot().state, PlaybackState::Paused);
    }

    #[test]
    fn test_removing_current_track_loads_successor() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("b")), false, false)
            .expect("load");
        assert!(engine.remove_from_queue(&MusicId::from_raw("b")).expect("remove"));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.tracks.len(), 2);
        assert_eq!(current_id(&engine).as_deref(), Some("c"));
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert!(player.calls().contains(&"load /music/c.mp3".to_string()));
    }

    #[test]
    fn test_removing_every_track_empties_engine() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.load(tracks(&["a"]), None, false, false).expect("load");
        engine.remove_from_queue(&MusicId::from_raw("a")).expect("remove");
        assert_eq!(engine.snapshot().state, PlaybackState::Empty);
        assert_eq!(engine.snapshot().current, None);
    }

    #[test]
    fn test_skip_previous_restarts_track_past_threshold() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b"]), Some(&MusicId::from_raw("b")), false, false)
            .expect("load");
        engine.handle_player_event(PlayerEvent::position(engine.current_token(), 10_000));
        engine.skip_previous().expect("restart");
        assert_eq!(current_id(&engine).as_deref(), Some("b"));
        assert_eq!(player.calls().last().map(String::as_str), Some("seek 0"));

        engine.skip_previous().expect("previous");
        assert_eq!(current_id(&engine).as_deref(), Some("a"));
    }

    #[test]
    fn test_seek_is_clamped_to_track_duration() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.load(tracks(&["a"]), None, false, false).expect("load");
        engine.seek_to(1.5).expect("seek");
        assert_eq!(engine.snapshot().position_ms, 100_000);
        engine.seek_to(-1.0).expect("seek");
        assert_eq!(engine.snapshot().position_ms, 0);
        engine.seek_to(0.25).expect("seek");
        assert_eq!(engine.snapshot().position_ms, 25_000);
    }

    #[test]
    fn test_player_error_skips_track_even_with_repeat_one() {
        let player = RecordingPlayer::default();
        let (engine, mut receiver) = engine_with(&player, None, RepeatMode::One);
        engine.load(tracks(&["a", "b"]), None, false, false).expect("load");
        drain(&mut receiver);
        engine.handle_player_event(PlayerEvent::error(engine.current_token(), "decode failed"));
        assert_eq!(current_id(&engine).as_deref(), Some("b"));
        assert!(drain(&mut receiver).iter().any(|message| matches!(
            message,
            QueueMessage::PlayerError { music_id, .. } if music_id.as_str() == "a"
        )));
    }

    #[test]
    fn test_all_tracks_failing_stops_playback() {
        let player = RecordingPlayer::default();
        for id in ["a", "b", "c"] {
            player.fail_on(&format!("/music/{id}.mp3"));
        }
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::All);
        engine.load(tracks(&["a", "b", "c"]), None, false, false).expect("load");
        assert_eq!(engine.snapshot().state, PlaybackState::Finished);
        let loads = player.calls().iter().filter(|call| call.starts_with("load")).count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_switching_shuffle_twice_restores_order_and_keeps_current() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine
            .load(tracks(&["a", "b", "c", "d"]), Some(&MusicId::from_raw("b")), false, false)
            .expect("load");
        assert!(engine.switch_shuffle_mode());
        assert_eq!(current_id(&engine).as_deref(), Some("b"));
        assert!(!engine.switch_shuffle_mode());
        let ids: Vec<String> = engine
            .snapshot()
            .tracks
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(current_id(&engine).as_deref(), Some("b"));
        let loads = player.calls().iter().filter(|call| call.starts_with("load")).count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_insert_next_and_append() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.append_to_queue(tracks(&["a", "b"])).expect("append");
        assert_eq!(engine.snapshot().state, PlaybackState::Loaded);
        engine.insert_next(tracks(&["x"])).expect("insert");
        engine.append_to_queue(tracks(&["z"])).expect("append");
        let ids: Vec<String> = engine
            .snapshot()
            .tracks
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "x", "b", "z"]);
        engine.skip_next().expect("skip");
        assert_eq!(current_id(&engine).as_deref(), Some("x"));
    }

    #[test]
    fn test_play_music_jumps_or_reports_not_found() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        engine.load(tracks(&["a", "b", "c"]), None, false, true).expect("load");
        engine.play_music(&MusicId::from_raw("c")).expect("play c");
        assert_eq!(current_id(&engine).as_deref(), Some("c"));
        assert_eq!(engine.snapshot().state, PlaybackState::Playing);
        assert!(matches!(
            engine.play_music(&MusicId::from_raw("nope")),
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(engine.play_index(9), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn test_restart_state_round_trip_prunes_missing_tracks() {
        let store = MemoryStore::default();
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, Some(store.clone()), RepeatMode::All);
        engine
            .load(tracks(&["a", "b", "c"]), Some(&MusicId::from_raw("c")), false, false)
            .expect("load");
        engine.handle_player_event(PlayerEvent::position(engine.current_token(), 42_000));

        let restored_player = RecordingPlayer::default();
        let (restored, _receiver) =
            engine_with(&restored_player, Some(store.clone()), RepeatMode::Off);
        assert!(restored
            .restore(|music_id| music_id.as_str() != "a")
            .expect("restore"));
        let snapshot = restored.snapshot();
        let ids: Vec<&str> = snapshot.tracks.iter().map(MusicId::as_str).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(current_id(&restored).as_deref(), Some("c"));
        assert_eq!(snapshot.state, PlaybackState::Loaded);
        assert_eq!(snapshot.repeat, RepeatMode::All);
        assert_eq!(snapshot.position_ms, 42_000);
        assert!(restored_player.calls().contains(&"seek 42000".to_string()));
    }

    #[test]
    fn test_corrupt_restart_state_is_dropped() {
        let store = MemoryStore::default();
        *store.json.lock().expect("store") = Some("{not json".to_string());
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, Some(store.clone()), RepeatMode::Off);
        assert!(!engine.restore(|_| true).expect("restore"));
        assert_eq!(engine.snapshot().state, PlaybackState::Empty);
        assert!(store.json.lock().expect("store").is_none());
    }

    #[test]
    fn test_snapshot_versions_increase() {
        let player = RecordingPlayer::default();
        let (engine, _receiver) = engine_with(&player, None, RepeatMode::Off);
        let before = engine.snapshot().version;
        engine.load(tracks(&["a", "b"]), None, false, false).expect("load");
        let loaded = engine.snapshot().version;
        engine.switch_repeat_mode();
        assert!(before < loaded);
        assert!(loaded < engine.snapshot().version);
    }
}
