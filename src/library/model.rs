//! Library entities and their identifiers.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::compare::TextKey;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_GENRE: &str = "Unknown Genre";
pub const VARIOUS_ARTISTS: &str = "Various Artists";

/// Reserved id of the virtual playlist derived from liked flags.
pub const LIKES_PLAYLIST_ID: &str = "likes";
pub const LIKES_PLAYLIST_TITLE: &str = "Likes";

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct MusicId(String);

impl MusicId {
    /// Derives an id from a track locator with a name-based (v5) UUID, so
    /// the same locator maps to the same id across releases. Local and
    /// catalog tracks live in separate id scopes.
    pub fn for_locator(locator: &str, remote: bool) -> Self {
        let uuid = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, locator.as_bytes());
        let scope = if remote { "remote" } else { "lib" };
        Self(format!("{scope}-{}", uuid.simple()))
    }

    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MusicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FolderId(pub u64);

/// Album identity: album artist key plus album title key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AlbumId(String);

impl AlbumId {
    pub fn new(artist_key: &TextKey, album_key: &TextKey) -> Self {
        Self(format!("{}\u{1f}{}", artist_key.as_str(), album_key.as_str()))
    }

    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct PlaylistId(String);

impl PlaylistId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn likes() -> Self {
        Self(LIKES_PLAYLIST_ID.to_string())
    }

    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_likes(&self) -> bool {
        self.0 == LIKES_PLAYLIST_ID
    }
}

impl std::fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One indexed track.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Music {
    pub id: MusicId,
    pub locator: String,
    pub title: String,
    pub artist_title: String,
    pub artist_key: TextKey,
    pub album_title: String,
    pub album_artist_title: String,
    pub album_id: AlbumId,
    pub genre_title: String,
    pub genre_key: TextKey,
    pub folder: Option<FolderId>,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub added_at_ms: i64,
    pub path_or_uri: String,
    pub artwork: Option<String>,
    pub compilation: bool,
    pub liked: bool,
    pub remote: bool,
}

/// A directory in the local library tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Folder {
    pub id: FolderId,
    pub path: PathBuf,
    pub title: String,
    pub parent: Option<FolderId>,
    /// Child folders ordered by title.
    pub children: Vec<FolderId>,
    /// Tracks directly inside this folder.
    pub music: BTreeSet<MusicId>,
    /// Number of tracks in this folder and all descendants.
    pub subtree_music_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Artist {
    pub key: TextKey,
    pub title: String,
    pub music: BTreeSet<MusicId>,
    /// Albums credited to this artist as album artist.
    pub albums: BTreeSet<AlbumId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    pub artist_key: TextKey,
    pub artist_title: String,
    pub compilation: bool,
    /// Earliest year among the album's tracks.
    pub year: Option<i32>,
    pub music: BTreeSet<MusicId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Genre {
    pub key: TextKey,
    pub title: String,
    pub music: BTreeSet<MusicId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub music_id: MusicId,
    pub added_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Playlist {
    pub id: PlaylistId,
    pub title: String,
    pub created_at_ms: i64,
    pub entries: Vec<PlaylistEntry>,
}

impl Playlist {
    pub fn contains(&self, music_id: &MusicId) -> bool {
        self.entries.iter().any(|entry| &entry.music_id == music_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Folder,
    Artist,
    Album,
    Genre,
    Music,
    Playlist,
}

/// Any browsable library entity. Collection-wide queries such as
/// `MediaIndex::entity_music` dispatch on this instead of on concrete types.
#[derive(Debug, Clone)]
pub enum MediaEntity {
    Folder(std::sync::Arc<Folder>),
    Artist(std::sync::Arc<Artist>),
    Album(std::sync::Arc<Album>),
    Genre(std::sync::Arc<Genre>),
    Music(std::sync::Arc<Music>),
    Playlist(std::sync::Arc<Playlist>),
}

impl MediaEntity {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Folder(_) => MediaKind::Folder,
            Self::Artist(_) => MediaKind::Artist,
            Self::Album(_) => MediaKind::Album,
            Self::Genre(_) => MediaKind::Genre,
            Self::Music(_) => MediaKind::Music,
            Self::Playlist(_) => MediaKind::Playlist,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Folder(folder) => &folder.title,
            Self::Artist(artist) => &artist.title,
            Self::Album(album) => &album.title,
            Self::Genre(genre) => &genre.title,
            Self::Music(music) => &music.title,
            Self::Playlist(playlist) => &playlist.title,
        }
    }

    /// Number of tracks the entity stands for; folders count their whole subtree.
    pub fn music_count(&self) -> usize {
        match self {
            Self::Folder(folder) => folder.subtree_music_count,
            Self::Artist(artist) => artist.music.len(),
            Self::Album(album) => album.music.len(),
            Self::Genre(genre) => genre.music.len(),
            Self::Music(_) => 1,
            Self::Playlist(playlist) => playlist.entries.len(),
        }
    }
}
