//! Canonical ordering rules shared by every sorted library view.
//!
//! Text is compared on a folded key first (diacritics stripped, lowercased,
//! whitespace collapsed) and then on raw bytes, so two strings only compare
//! equal when they are identical. Entity comparators chain tie-breaks and
//! always end on the entity id, which makes every ordering total and
//! independent of insertion or traversal order.

use std::cmp::Ordering;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::library::model::{Album, Artist, Genre, Music, Playlist};

/// Folded comparison key for a user-visible title.
///
/// Two titles with the same key are treated as the same artist, album or
/// genre, and as a duplicate playlist name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TextKey(String);

impl TextKey {
    pub fn new(text: &str) -> Self {
        let mut folded = String::with_capacity(text.len());
        let mut pending_space = false;
        for ch in text.nfkd().filter(|ch| !is_combining_mark(*ch)) {
            if ch.is_whitespace() {
                pending_space = !folded.is_empty();
                continue;
            }
            if pending_space {
                folded.push(' ');
                pending_space = false;
            }
            folded.extend(ch.to_lowercase());
        }
        Self(folded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, needle: &TextKey) -> bool {
        self.0.contains(needle.as_str())
    }
}

/// Total order over titles: folded key first, exact bytes as tie-break.
pub fn compare_text(left: &str, right: &str) -> Ordering {
    TextKey::new(left)
        .cmp(&TextKey::new(right))
        .then_with(|| left.cmp(right))
}

/// Ordering direction applied to the primary key of a sort option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }
}

/// Sort options for track listings.
///
/// Tie-break chains (each key only decides when all previous keys are equal):
/// - `Title`: title, artist, album, track number, id
/// - `Artist`: artist, album, disc, track number, title, id
/// - `Album`: album, album artist, disc, track number, title, id
/// - `Genre`: genre, artist, album, disc, track number, title, id
/// - `AddedDate`: newest first, title, id
/// - `Year`: year (unknown last), album, disc, track number, title, id
/// - `Duration`: shortest first, title, id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MusicSort {
    #[default]
    Title,
    Artist,
    Album,
    Genre,
    AddedDate,
    Year,
    Duration,
}

/// Sort options for album listings: `Title` (title, artist, id),
/// `Artist` (artist, year, title, id), `Year` (year unknown last, title, id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlbumSort {
    #[default]
    Title,
    Artist,
    Year,
}

/// Sort options for playlist listings: `Title` (title, id),
/// `Created` (oldest first, title, id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistSort {
    #[default]
    Title,
    Created,
}

fn compare_track_position(left: &Music, right: &Music) -> Ordering {
    left.disc_number
        .cmp(&right.disc_number)
        .then_with(|| left.track_number.cmp(&right.track_number))
}

// Unknown years sort after every known year.
fn compare_optional_year(left: Option<i32>, right: Option<i32>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn compare_music(
    left: &Music,
    right: &Music,
    sort: MusicSort,
    direction: SortDirection,
) -> Ordering {
    let primary = match sort {
        MusicSort::Title => compare_text(&left.title, &right.title)
            .then_with(|| compare_text(&left.artist_title, &right.artist_title))
            .then_with(|| compare_text(&left.album_title, &right.album_title))
            .then_with(|| left.track_number.cmp(&right.track_number)),
        MusicSort::Artist => compare_text(&left.artist_title, &right.artist_title)
            .then_with(|| compare_text(&left.album_title, &right.album_title))
            .then_with(|| compare_track_position(left, right))
            .then_with(|| compare_text(&left.title, &right.title)),
        MusicSort::Album => compare_text(&left.album_title, &right.album_title)
            .then_with(|| compare_text(&left.album_artist_title, &right.album_artist_title))
            .then_with(|| compare_track_position(left, right))
            .then_with(|| compare_text(&left.title, &right.title)),
        MusicSort::Genre => compare_text(&left.genre_title, &right.genre_title)
            .then_with(|| compare_text(&left.artist_title, &right.artist_title))
            .then_with(|| compare_text(&left.album_title, &right.album_title))
            .then_with(|| compare_track_position(left, right))
            .then_with(|| compare_text(&left.title, &right.title)),
        MusicSort::AddedDate => right
            .added_at_ms
            .cmp(&left.added_at_ms)
            .then_with(|| compare_text(&left.title, &right.title)),
        MusicSort::Year => compare_optional_year(left.year, right.year)
            .then_with(|| compare_text(&left.album_title, &right.album_title))
            .then_with(|| compare_track_position(left, right))
            .then_with(|| compare_text(&left.title, &right.title)),
        MusicSort::Duration => left
            .duration_ms
            .cmp(&right.duration_ms)
            .then_with(|| compare_text(&left.title, &right.title)),
    };
    direction
        .apply(primary)
        .then_with(|| left.id.cmp(&right.id))
}

/// Playlist entries: by the time they were added, then by track title.
pub fn compare_playlist_entries(
    left: (&Music, i64),
    right: (&Music, i64),
    direction: SortDirection,
) -> Ordering {
    let primary = left
        .1
        .cmp(&right.1)
        .then_with(|| compare_text(&left.0.title, &right.0.title));
    direction
        .apply(primary)
        .then_with(|| left.0.id.cmp(&right.0.id))
}

pub fn compare_artists(left: &Artist, right: &Artist) -> Ordering {
    compare_text(&left.title, &right.title).then_with(|| left.key.cmp(&right.key))
}

pub fn compare_genres(left: &Genre, right: &Genre) -> Ordering {
    compare_text(&left.title, &right.title).then_with(|| left.key.cmp(&right.key))
}

pub fn compare_albums(
    left: &Album,
    right: &Album,
    sort: AlbumSort,
    direction: SortDirection,
) -> Ordering {
    let primary = match sort {
        AlbumSort::Title => compare_text(&left.title, &right.title)
            .then_with(|| compare_text(&left.artist_title, &right.artist_title)),
        AlbumSort::Artist => compare_text(&left.artist_title, &right.artist_title)
            .then_with(|| compare_optional_year(left.year, right.year))
            .then_with(|| compare_text(&left.title, &right.title)),
        AlbumSort::Year => compare_optional_year(left.year, right.year)
            .then_with(|| compare_text(&left.title, &right.title)),
    };
    direction
        .apply(primary)
        .then_with(|| left.id.cmp(&right.id))
}

pub fn compare_playlists(
    left: &Playlist,
    right: &Playlist,
    sort: PlaylistSort,
    direction: SortDirection,
) -> Ordering {
    let primary = match sort {
        PlaylistSort::Title => compare_text(&left.title, &right.title),
        PlaylistSort::Created => left
            .created_at_ms
            .cmp(&right.created_at_ms)
            .then_with(|| compare_text(&left.title, &right.title)),
    };
    direction
        .apply(primary)
        .then_with(|| left.id.cmp(&right.id))
}
