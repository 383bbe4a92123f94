//! Ordered playback queue: original order, active (possibly shuffled)
//! order and the cursor into it. Pure data, no locking and no player calls.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::library::model::{Music, MusicId};
use crate::protocol::RepeatMode;

/// A track handed to the queue: library id plus what the player loads.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct QueueTrack {
    pub music_id: MusicId,
    pub path_or_uri: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl QueueTrack {
    pub fn new(music_id: MusicId, path_or_uri: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            music_id,
            path_or_uri: path_or_uri.into(),
            duration_ms,
        }
    }

    pub fn from_music(music: &Music) -> Self {
        Self::new(music.id.clone(), music.path_or_uri.clone(), music.duration_ms)
    }
}

/// One queue slot. The same track may occupy several slots; `entry_id`
/// tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub entry_id: u64,
    pub track: QueueTrack,
}

/// Where the cursor goes when advancing or going back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    To(usize),
    /// Past the end with repeat off; the cursor stays on the last entry.
    Finished,
}

/// Summary of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    pub removed: usize,
    pub current_removed: bool,
    /// The removed current entry was last and repeat is off.
    pub ran_off_end: bool,
}

/// Shuffles `entries`, then moves the entry `first` (if any) to the front.
pub fn shuffled_order(
    entries: &[QueueEntry],
    first: Option<u64>,
    rng: &mut StdRng,
) -> Vec<QueueEntry> {
    let mut order = entries.to_vec();
    order.shuffle(rng);
    if let Some(first) = first {
        if let Some(position) = order.iter().position(|entry| entry.entry_id == first) {
            let entry = order.remove(position);
            order.insert(0, entry);
        }
    }
    order
}

#[derive(Debug, Clone, Default)]
pub struct Queue {
    original: Vec<QueueEntry>,
    active: Vec<QueueEntry>,
    current: Option<usize>,
    shuffle: bool,
    repeat: RepeatMode,
    next_entry_id: u64,
}

impl Queue {
    /// Builds a queue from `tracks`. With shuffle on, `start_at` (an index
    /// into `tracks`) is placed first in the shuffled order.
    pub fn build(
        tracks: Vec<QueueTrack>,
        start_at: usize,
        shuffle: bool,
        repeat: RepeatMode,
        rng: &mut StdRng,
    ) -> Self {
        let original = Self::number_entries(tracks);
        let next_entry_id = original.len() as u64;
        let start_entry = original.get(start_at).map(|entry| entry.entry_id);
        let (active, current) = if shuffle {
            (shuffled_order(&original, start_entry, rng), start_entry.map(|_| 0))
        } else {
            (original.clone(), start_entry.map(|_| start_at))
        };
        Self {
            original,
            active,
            current,
            shuffle,
            repeat,
            next_entry_id,
        }
    }

    fn number_entries(tracks: Vec<QueueTrack>) -> Vec<QueueEntry> {
        tracks
            .into_iter()
            .enumerate()
            .map(|(index, track)| QueueEntry {
                entry_id: index as u64,
                track,
            })
            .collect()
    }

    /// Rebuilds a queue from persisted orders. `active_order` holds indices
    /// into `tracks`; an order that is not a permutation falls back to the
    /// original order, with `current` translated through the stored order.
    pub fn from_parts(
        tracks: Vec<QueueTrack>,
        active_order: &[usize],
        current: Option<usize>,
        shuffle: bool,
        repeat: RepeatMode,
    ) -> Self {
        let original = Self::number_entries(tracks);
        let mut queue = Self {
            next_entry_id: original.len() as u64,
            active: original.clone(),
            original,
            current: None,
            shuffle: false,
            repeat,
        };
        let mut seen = vec![false; queue.original.len()];
        let valid = active_order.len() == queue.original.len()
            && active_order.iter().all(|index| {
                *index < seen.len() && !std::mem::replace(&mut seen[*index], true)
            });
        if valid {
            queue.active = active_order
                .iter()
                .map(|index| queue.original[*index].clone())
                .collect();
            queue.shuffle = shuffle;
            queue.current = current.filter(|index| *index < queue.active.len());
        } else {
            queue.current = current
                .and_then(|index| active_order.get(index).copied())
                .filter(|index| *index < queue.original.len());
        }
        if queue.current.is_none() && !queue.active.is_empty() {
            queue.current = Some(0);
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn current_entry(&self) -> Option<&QueueEntry> {
        self.current.and_then(|index| self.active.get(index))
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.active
    }

    pub fn original_entries(&self) -> &[QueueEntry] {
        &self.original
    }

    pub fn music_ids(&self) -> Vec<MusicId> {
        self.active
            .iter()
            .map(|entry| entry.track.music_id.clone())
            .collect()
    }

    /// Active order expressed as indices into the original order.
    pub fn active_order(&self) -> Vec<usize> {
        let positions: HashMap<u64, usize> = self
            .original
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.entry_id, position))
            .collect();
        self.active
            .iter()
            .filter_map(|entry| positions.get(&entry.entry_id).copied())
            .collect()
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
    }

    pub fn position_of(&self, music_id: &MusicId) -> Option<usize> {
        self.active
            .iter()
            .position(|entry| &entry.track.music_id == music_id)
    }

    pub fn jump(&mut self, index: usize) -> bool {
        if index < self.active.len() {
            self.current = Some(index);
            true
        } else {
            false
        }
    }

    /// Next cursor position. Repeat ONE stays on the current entry.
    pub fn next_step(&self) -> Option<Step> {
        let current = self.current?;
        let step = match self.repeat {
            RepeatMode::One => Step::To(current),
            _ if current + 1 < self.active.len() => Step::To(current + 1),
            RepeatMode::All => Step::To(0),
            RepeatMode::Off => Step::Finished,
        };
        Some(step)
    }

    /// Next cursor position ignoring repeat ONE; used to skip failing tracks.
    pub fn next_step_past_current(&self) -> Option<Step> {
        let current = self.current?;
        let step = if current + 1 < self.active.len() {
            Step::To(current + 1)
        } else if self.repeat == RepeatMode::Off {
            Step::Finished
        } else {
            Step::To(0)
        };
        Some(step)
    }

    /// Previous cursor position. At the start, repeat ALL wraps to the last
    /// entry and repeat OFF stays on the first.
    pub fn previous_step(&self) -> Option<Step> {
        let current = self.current?;
        let step = match self.repeat {
            RepeatMode::One => Step::To(current),
            _ if current > 0 => Step::To(current - 1),
            RepeatMode::All => Step::To(self.active.len() - 1),
            RepeatMode::Off => Step::To(0),
        };
        Some(step)
    }

    /// Switches shuffle. Enabling keeps the current track first in the new
    /// order; disabling restores the original order at the current track.
    pub fn set_shuffle(&mut self, enabled: bool, rng: &mut StdRng) {
        if self.shuffle == enabled {
            return;
        }
        let current_entry = self.current_entry().map(|entry| entry.entry_id);
        if enabled {
            self.active = shuffled_order(&self.original, current_entry, rng);
            self.current = current_entry.map(|_| 0);
        } else {
            self.active = self.original.clone();
            self.current = current_entry.and_then(|entry_id| {
                self.active
                    .iter()
                    .position(|entry| entry.entry_id == entry_id)
            });
        }
        self.shuffle = enabled;
    }

    fn make_entries(&mut self, tracks: Vec<QueueTrack>) -> Vec<QueueEntry> {
        tracks
            .into_iter()
            .map(|track| {
                let entry = QueueEntry {
                    entry_id: self.next_entry_id,
                    track,
                };
                self.next_entry_id += 1;
                entry
            })
            .collect()
    }

    /// Inserts tracks right after the current entry in both orders. On an
    /// empty queue the tracks become the queue with the cursor on the first.
    pub fn insert_next(&mut self, tracks: Vec<QueueTrack>) {
        let entries = self.make_entries(tracks);
        let Some(current) = self.current else {
            self.append_entries(entries);
            return;
        };
        let current_entry_id = self.active[current].entry_id;
        let original_position = self
            .original
            .iter()
            .position(|entry| entry.entry_id == current_entry_id)
            .map(|position| position + 1)
            .unwrap_or(self.original.len());
        self.original
            .splice(original_position..original_position, entries.iter().cloned());
        self.active.splice(current + 1..current + 1, entries);
    }

    pub fn append(&mut self, tracks: Vec<QueueTrack>) {
        let entries = self.make_entries(tracks);
        self.append_entries(entries);
    }

    fn append_entries(&mut self, entries: Vec<QueueEntry>) {
        self.original.extend(entries.iter().cloned());
        self.active.extend(entries);
        if self.current.is_none() && !self.active.is_empty() {
            self.current = Some(0);
        }
    }

    /// Moves an entry within the active order; the cursor follows the
    /// current entry. Without shuffle the original order moves too.
    pub fn move_entry(&mut self, from: usize, to: usize) -> bool {
        if from >= self.active.len() || self.active.is_empty() {
            return false;
        }
        let to = to.min(self.active.len() - 1);
        if from == to {
            return false;
        }
        let current_entry = self.current_entry().map(|entry| entry.entry_id);
        let entry = self.active.remove(from);
        self.active.insert(to, entry);
        if !self.shuffle {
            self.original = self.active.clone();
        }
        self.current = current_entry.and_then(|entry_id| {
            self.active
                .iter()
                .position(|entry| entry.entry_id == entry_id)
        });
        true
    }

    /// Removes every entry of `music_id`. A removed current entry is
    /// replaced by the next remaining entry at the same position; past the
    /// end, repeat ALL wraps to the first entry and otherwise the new last
    /// entry is selected.
    pub fn remove(&mut self, music_id: &MusicId) -> Removal {
        let current_entry = self.current_entry().map(|entry| entry.entry_id);
        let removed_before_current = self.current.map(|current| {
            self.active[..current]
                .iter()
                .filter(|entry| &entry.track.music_id == music_id)
                .count()
        });

        let before = self.active.len();
        self.active.retain(|entry| &entry.track.music_id != music_id);
        self.original.retain(|entry| &entry.track.music_id != music_id);
        let removed = before - self.active.len();
        if removed == 0 {
            return Removal::default();
        }

        let (Some(old_current), Some(current_entry)) = (self.current, current_entry) else {
            return Removal {
                removed,
                ..Removal::default()
            };
        };

        if let Some(position) = self
            .active
            .iter()
            .position(|entry| entry.entry_id == current_entry)
        {
            self.current = Some(position);
            return Removal {
                removed,
                ..Removal::default()
            };
        }

        let successor = old_current - removed_before_current.unwrap_or(0);
        let mut ran_off_end = false;
        self.current = if self.active.is_empty() {
            None
        } else if successor < self.active.len() {
            Some(successor)
        } else if self.repeat == RepeatMode::All {
            Some(0)
        } else {
            ran_off_end = true;
            Some(self.active.len() - 1)
        };
        Removal {
            removed,
            current_removed: true,
            ran_off_end,
        }
    }

    pub fn clear(&mut self) {
        self.original.clear();
        self.active.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tracks(ids: &[&str]) -> Vec<QueueTrack> {
        ids.iter()
            .map(|id| QueueTrack::new(MusicId::from_raw(id), format!("/music/{id}.mp3"), 200_000))
            .collect()
    }

    fn ids(queue: &Queue) -> Vec<String> {
        queue
            .music_ids()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn build(ids: &[&str], start_at: usize, shuffle: bool, repeat: RepeatMode) -> Queue {
        Queue::build(tracks(ids), start_at, shuffle, repeat, &mut rng())
    }

    #[test]
    fn test_repeat_all_wraps_from_last_to_first() {
        let mut queue = build(&["a", "b", "c"], 2, false, RepeatMode::All);
        assert_eq!(queue.next_step(), Some(Step::To(0)));
        queue.set_repeat(RepeatMode::Off);
        assert_eq!(queue.next_step(), Some(Step::Finished));
        queue.set_repeat(RepeatMode::One);
        assert_eq!(queue.next_step(), Some(Step::To(2)));
        assert_eq!(queue.next_step_past_current(), Some(Step::To(0)));
    }

    #[test]
    fn test_previous_at_start_depends_on_repeat() {
        let mut queue = build(&["a", "b", "c"], 0, false, RepeatMode::Off);
        assert_eq!(queue.previous_step(), Some(Step::To(0)));
        queue.set_repeat(RepeatMode::All);
        assert_eq!(queue.previous_step(), Some(Step::To(2)));
        queue.jump(1);
        assert_eq!(queue.previous_step(), Some(Step::To(0)));
    }

    #[test]
    fn test_empty_queue_has_no_steps() {
        let queue = Queue::default();
        assert_eq!(queue.next_step(), None);
        assert_eq!(queue.previous_step(), None);
        assert!(queue.current_entry().is_none());
    }

    #[test]
    fn test_shuffle_puts_start_track_first_and_keeps_all_tracks() {
        let queue = build(&["a", "b", "c", "d", "e"], 3, true, RepeatMode::Off);
        assert_eq!(queue.current(), Some(0));
        assert_eq!(queue.current_entry().map(|entry| entry.track.music_id.as_str()), Some("d"));
        let mut sorted = ids(&queue);
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_toggling_shuffle_twice_restores_original_order() {
        let mut queue = build(&["a", "b", "c", "d"], 2, false, RepeatMode::Off);
        let mut rng = rng();
        queue.set_shuffle(true, &mut rng);
        assert_eq!(queue.current(), Some(0));
        queue.set_shuffle(false, &mut rng);
        assert_eq!(ids(&queue), vec!["a", "b", "c", "d"]);
        assert_eq!(queue.current(), Some(2));
    }

    #[test]
    fn test_removing_current_selects_the_following_track() {
        let mut queue = build(&["a", "b", "c"], 1, false, RepeatMode::Off);
        let removal = queue.remove(&MusicId::from_raw("b"));
        assert!(removal.current_removed);
        assert!(!removal.ran_off_end);
        assert_eq!(ids(&queue), vec!["a", "c"]);
        assert_eq!(queue.current_entry().map(|entry| entry.track.music_id.as_str()), Some("c"));
    }

    #[test]
    fn test_removing_last_current_track_depends_on_repeat() {
        let mut queue = build(&["a", "b", "c"], 2, false, RepeatMode::Off);
        let removal = queue.remove(&MusicId::from_raw("c"));
        assert!(removal.ran_off_end);
        assert_eq!(queue.current(), Some(1));

        let mut queue = build(&["a", "b", "c"], 2, false, RepeatMode::All);
        let removal = queue.remove(&MusicId::from_raw("c"));
        assert!(!removal.ran_off_end);
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_removing_track_before_current_keeps_cursor_on_same_track() {
        let mut queue = build(&["a", "b", "c"], 2, false, RepeatMode::Off);
        let removal = queue.remove(&MusicId::from_raw("a"));
        assert_eq!(removal.removed, 1);
        assert!(!removal.current_removed);
        assert_eq!(queue.current(), Some(1));
        assert_eq!(queue.remove(&MusicId::from_raw("zzz")), Removal::default());
    }

    #[test]
    fn test_removing_only_track_empties_queue() {
        let mut queue = build(&["a"], 0, false, RepeatMode::All);
        let removal = queue.remove(&MusicId::from_raw("a"));
        assert!(removal.current_removed);
        assert!(queue.is_empty());
        assert_eq!(queue.current(), None);
    }

    #[test]
    fn test_insert_next_survives_disabling_shuffle() {
        let mut rng = rng();
        let mut queue =
            Queue::build(tracks(&["a", "b", "c", "d"]), 1, true, RepeatMode::Off, &mut rng);
        queue.insert_next(tracks(&["x"]));
        assert_eq!(queue.entries()[1].track.music_id.as_str(), "x");
        queue.set_shuffle(false, &mut rng);
        assert_eq!(ids(&queue), vec!["a", "b", "x", "c", "d"]);
        assert_eq!(queue.current(), Some(1));
    }

    #[test]
    fn test_append_and_insert_on_empty_queue_select_first() {
        let mut queue = Queue::default();
        queue.append(tracks(&["a", "b"]));
        assert_eq!(queue.current(), Some(0));
        let mut queue = Queue::default();
        queue.insert_next(tracks(&["x"]));
        assert_eq!(ids(&queue), vec!["x"]);
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_duplicate_tracks_are_distinct_entries() {
        let mut queue = build(&["a", "b"], 0, false, RepeatMode::Off);
        queue.append(tracks(&["a"]));
        assert_eq!(queue.len(), 3);
        let removal = queue.remove(&MusicId::from_raw("a"));
        assert_eq!(removal.removed, 2);
        assert_eq!(ids(&queue), vec!["b"]);
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_move_entry_keeps_cursor_on_current_track() {
        let mut queue = build(&["a", "b", "c"], 0, false, RepeatMode::Off);
        assert!(queue.move_entry(0, 2));
        assert_eq!(ids(&queue), vec!["b", "c", "a"]);
        assert_eq!(queue.current(), Some(2));
        assert!(!queue.move_entry(5, 0));
    }

    #[test]
    fn test_from_parts_rejects_invalid_orders() {
        let queue =
            Queue::from_parts(tracks(&["a", "b", "c"]), &[2, 0, 1], Some(1), true, RepeatMode::All);
        assert_eq!(ids(&queue), vec!["c", "a", "b"]);
        assert!(queue.shuffle());
        assert_eq!(queue.active_order(), vec![2, 0, 1]);

        let queue =
            Queue::from_parts(tracks(&["a", "b", "c"]), &[0, 0, 1], Some(9), true, RepeatMode::Off);
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
        assert!(!queue.shuffle());
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_from_parts_fallback_keeps_the_stored_current_track() {
        let queue =
            Queue::from_parts(tracks(&["a", "b", "c"]), &[2, 2, 0], Some(0), true, RepeatMode::Off);
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.current_entry().map(|entry| entry.track.music_id.as_str()), Some("c"));

        let queue = Queue::from_parts(tracks(&["a", "b"]), &[1, 7], Some(1), true, RepeatMode::Off);
        assert_eq!(queue.current(), Some(0));
    }

    #[test]
    fn test_active_order_follows_shuffle_and_edits() {
        let mut rng = rng();
        let mut queue =
            Queue::build(tracks(&["a", "b", "c", "d", "e"]), 0, true, RepeatMode::Off, &mut rng);
        let order = queue.active_order();
        let original = queue.original_entries().to_vec();
        let active: Vec<u64> = queue.entries().iter().map(|entry| entry.entry_id).collect();
        let mapped: Vec<u64> = order.iter().map(|index| original[*index].entry_id).collect();
        assert_eq!(mapped, active);

        queue.remove(&MusicId::from_raw("c"));
        queue.append(tracks(&["f"]));
        let mut order = queue.active_order();
        assert_eq!(order.len(), 5);
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
