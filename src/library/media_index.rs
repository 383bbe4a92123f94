//! In-memory media index.
//!
//! The index owns every library entity and the sorted views derived from
//! them. All maps live behind `Arc`s and are copied on write, so cloning an
//! index is O(1) and a clone handed to readers stays valid while the writer
//! keeps mutating its own copy.
//!
//! Sorted views are maintained incrementally: entries are removed by id and
//! re-inserted with a binary search, so an update never reorders untouched
//! elements. Folder membership counts are kept per subtree and adjusted only
//! along the ancestor path of the touched folder.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, trace};

use crate::compare::{
    compare_albums, compare_artists, compare_genres, compare_music, compare_playlist_entries,
    compare_playlists, compare_text, AlbumSort, MusicSort, PlaylistSort, SortDirection, TextKey,
};
use crate::error::IndexError;
use crate::library::catalog::TrackRecord;
use crate::library::model::{
    Album, AlbumId, Artist, Folder, FolderId, Genre, MediaEntity, Music, MusicId, Playlist,
    PlaylistEntry, PlaylistId, LIKES_PLAYLIST_TITLE, UNKNOWN_ALBUM, UNKNOWN_ARTIST, UNKNOWN_GENRE,
    VARIOUS_ARTISTS,
};

pub(crate) fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Result of removing a track: the removed entity and the playlists that
/// lost entries because of it.
#[derive(Debug, Clone)]
pub struct RemovedMusic {
    pub music: Arc<Music>,
    pub playlists: Vec<PlaylistId>,
}

/// Playlist row as restored from the persistent store, keyed by locator.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredPlaylist {
    pub id: PlaylistId,
    pub title: String,
    pub created_at_ms: i64,
    pub entries: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub music: Vec<Arc<Music>>,
    pub artists: Vec<Arc<Artist>>,
    pub albums: Vec<Arc<Album>>,
}

#[derive(Debug, Clone, Default)]
struct SortedViews {
    music_by_title: Arc<Vec<MusicId>>,
    liked_by_title: Arc<Vec<MusicId>>,
    artists_by_title: Arc<Vec<TextKey>>,
    albums_by_title: Arc<Vec<AlbumId>>,
    genres_by_title: Arc<Vec<TextKey>>,
    playlists_by_title: Arc<Vec<PlaylistId>>,
    root_folders: Arc<Vec<FolderId>>,
}

fn insert_sorted<K, F>(view: &mut Vec<K>, key: K, compare: F)
where
    F: Fn(&K, &K) -> Ordering,
{
    if let Err(position) = view.binary_search_by(|probe| compare(probe, &key)) {
        view.insert(position, key);
    }
}

fn remove_from_view<K: PartialEq>(view: &mut Vec<K>, key: &K) -> bool {
    match view.iter().position(|probe| probe == key) {
        Some(position) => {
            view.remove(position);
            true
        }
        None => false,
    }
}

fn compare_in<K, V, F>(map: &HashMap<K, Arc<V>>, left: &K, right: &K, compare: F) -> Ordering
where
    K: Eq + Hash + Ord,
    F: Fn(&V, &V) -> Ordering,
{
    match (map.get(left), map.get(right)) {
        (Some(left), Some(right)) => compare(&**left, &**right),
        _ => left.cmp(right),
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn compare_folders(left: &Folder, right: &Folder) -> Ordering {
    compare_text(&left.title, &right.title).then_with(|| left.path.cmp(&right.path))
}

fn folder_title(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn title_from_locator(locator: &str) -> String {
    Path::new(locator)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| locator.to_string())
}

/// The library catalog and its derived views.
#[derive(Debug, Clone, Default)]
pub struct MediaIndex {
    version: u64,
    library_roots: Arc<Vec<PathBuf>>,
    music: Arc<HashMap<MusicId, Arc<Music>>>,
    music_by_locator: Arc<HashMap<String, MusicId>>,
    folders: Arc<HashMap<FolderId, Arc<Folder>>>,
    folder_by_path: Arc<HashMap<PathBuf, FolderId>>,
    next_folder_id: u64,
    artists: Arc<HashMap<TextKey, Arc<Artist>>>,
    albums: Arc<HashMap<AlbumId, Arc<Album>>>,
    genres: Arc<HashMap<TextKey, Arc<Genre>>>,
    playlists: Arc<HashMap<PlaylistId, Arc<Playlist>>>,
    /// Liked locators with the time they were liked. Kept for tracks that
    /// are not (yet) in the catalog so the flag survives rescans.
    liked_locators: Arc<HashMap<String, i64>>,
    views: SortedViews,
}

impl MediaIndex {
    /// Creates an empty index. Folders listed in `library_roots` become
    /// root folders; tracks outside them hang off their top-most directory.
    pub fn new(library_roots: Vec<PathBuf>) -> Self {
        Self {
            library_roots: Arc::new(library_roots),
            ..Self::default()
        }
    }

    /// Monotonic counter bumped by every mutation that changed observable
    /// state.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn music_count(&self) -> usize {
        self.music.len()
    }

    // ---------------------------------------------------------------------
    // Track insert / update / remove
    // ---------------------------------------------------------------------

    fn normalize(
        &self,
        record: &TrackRecord,
        existing: Option<&Music>,
    ) -> (Music, Option<PathBuf>) {
        let locator = record.locator.trim().to_string();
        let title = clean(&record.title).unwrap_or_else(|| title_from_locator(&locator));
        let artist_title =
            clean(&record.artist_title).unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        let album_artist_title =
            clean(&record.album_artist_title).unwrap_or_else(|| artist_title.clone());
        let album_title = clean(&record.album_title).unwrap_or_else(|| UNKNOWN_ALBUM.to_string());
        let genre_title = clean(&record.genre_title).unwrap_or_else(|| UNKNOWN_GENRE.to_string());
        let album_artist_key = TextKey::new(&album_artist_title);
        let compilation =
            record.compilation || album_artist_key == TextKey::new(VARIOUS_ARTISTS);
        let path_or_uri = clean(&record.path_or_uri).unwrap_or_else(|| locator.clone());
        let folder_path = if record.remote {
            None
        } else {
            Path::new(&path_or_uri)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
        };

        let id = existing
            .map(|music| music.id.clone())
            .unwrap_or_else(|| MusicId::for_locator(&locator, record.remote));
        let liked = existing
            .map(|music| music.liked)
            .unwrap_or_else(|| self.liked_locators.contains_key(&locator));
        let added_at_ms = record
            .added_at_ms
            .or_else(|| existing.map(|music| music.added_at_ms))
            .unwrap_or_else(unix_now_ms);

        let music = Music {
            id,
            artist_key: TextKey::new(&artist_title),
            album_id: AlbumId::new(&album_artist_key, &TextKey::new(&album_title)),
            genre_key: TextKey::new(&genre_title),
            locator,
            title,
            artist_title,
            album_title,
            album_artist_title,
            genre_title,
            folder: None,
            duration_ms: record.duration_ms.unwrap_or(0),
            size_bytes: record.size_bytes.unwrap_or(0),
            track_number: record.track_number,
            disc_number: record.disc_number,
            year: record.year,
            added_at_ms,
            path_or_uri,
            artwork: clean(&record.artwork),
            compilation,
            liked,
            remote: record.remote,
        };
        (music, folder_path)
    }

    /// Inserts a new track or updates the track with the same locator.
    /// Re-upserting identical metadata leaves the index untouched.
    pub fn upsert_music(&mut self, record: &TrackRecord) -> Result<UpsertOutcome, IndexError> {
        if record.locator.trim().is_empty() {
            return Err(IndexError::InvalidInput(
                "track record without locator".to_string(),
            ));
        }

        let existing = self
            .music_by_locator
            .get(record.locator.trim())
            .and_then(|id| self.music.get(id))
            .cloned();
        let (mut music, folder_path) = self.normalize(record, existing.as_deref());

        match existing {
            None => {
                trace!("Index insert {} ({})", music.id, music.locator);
                if let Some(path) = &folder_path {
                    music.folder = Some(self.link_folder(&music.id, path));
                }
                self.link_new_music(music);
                self.bump_version();
                Ok(UpsertOutcome::Inserted)
            }
            Some(old) => {
                let old_folder_path = old
                    .folder
                    .and_then(|folder_id| self.folders.get(&folder_id))
                    .map(|folder| folder.path.clone());
                if old_folder_path == folder_path {
                    music.folder = old.folder;
                }
                if *old == music {
                    return Ok(UpsertOutcome::Unchanged);
                }
                trace!("Index update {} ({})", music.id, music.locator);
                self.relink_music(&old, music, folder_path, old_folder_path);
                self.bump_version();
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Applies a full catalog listing. Invalid records are skipped.
    pub fn apply_batch(&mut self, records: &[TrackRecord]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for record in records {
            match self.upsert_music(record) {
                Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
                Ok(UpsertOutcome::Updated) => summary.updated += 1,
                Ok(UpsertOutcome::Unchanged) => summary.unchanged += 1,
                Err(err) => {
                    debug!("Skipping catalog record: {}", err);
                    summary.rejected += 1;
                }
            }
        }
        summary
    }

    fn link_new_music(&mut self, music: Music) {
        let id = music.id.clone();
        let liked = music.liked;
        Arc::make_mut(&mut self.music_by_locator).insert(music.locator.clone(), id.clone());
        let music = Arc::new(music);
        Arc::make_mut(&mut self.music).insert(id.clone(), Arc::clone(&music));

        self.link_artist(&music.artist_key, &music.artist_title, &id);
        self.link_album(&music);
        self.link_genre(&music.genre_key, &music.genre_title, &id);
        self.insert_music_views(&id, liked);
    }

    fn relink_music(
        &mut self,
        old: &Music,
        mut music: Music,
        folder_path: Option<PathBuf>,
        old_folder_path: Option<PathBuf>,
    ) {
        let id = music.id.clone();
        self.remove_music_views(&id);

        // New buckets are linked before old ones are released so shared
        // parents are never collected and recreated.
        if folder_path != old_folder_path {
            music.folder = folder_path
                .as_deref()
                .map(|path| self.link_folder(&id, path));
            if let Some(old_folder) = old.folder {
                self.unlink_folder(&id, old_folder);
            }
        }

        let music = Arc::new(music);
        Arc::make_mut(&mut self.music).insert(id.clone(), Arc::clone(&music));

        if music.artist_key != old.artist_key {
            self.link_artist(&music.artist_key, &music.artist_title, &id);
            self.unlink_artist(&old.artist_key, &id);
        }
        if music.album_id != old.album_id {
            self.link_album(&music);
            self.unlink_album(&old.album_id, &id);
        } else {
            self.refresh_album_summary(&music.album_id);
        }
        if music.genre_key != old.genre_key {
            self.link_genre(&music.genre_key, &music.genre_title, &id);
            self.unlink_genre(&old.genre_key, &id);
        }

        self.insert_music_views(&id, music.liked);
    }

    /// Removes a track from every bucket, view and playlist and collects
    /// entities left empty.
    pub fn remove_music(&mut self, id: &MusicId) -> Result<RemovedMusic, IndexError> {
        let music = self
            .music
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("music", id.as_str()))?;

        self.remove_music_views(id);
        if let Some(folder_id) = music.folder {
            self.unlink_folder(id, folder_id);
        }
        Arc::make_mut(&mut self.music).remove(id);
        Arc::make_mut(&mut self.music_by_locator).remove(&music.locator);
        self.unlink_artist(&music.artist_key, id);
        self.unlink_album(&music.album_id, id);
        self.unlink_genre(&music.genre_key, id);

        let affected: Vec<PlaylistId> = self
            .playlists
            .values()
            .filter(|playlist| playlist.contains(id))
            .map(|playlist| playlist.id.clone())
            .collect();
        let playlists = Arc::make_mut(&mut self.playlists);
        for playlist_id in &affected {
            if let Some(playlist) = playlists.get_mut(playlist_id) {
                Arc::make_mut(playlist)
                    .entries
                    .retain(|entry| &entry.music_id != id);
            }
        }

        self.bump_version();
        trace!("Index removed {} ({})", id, music.locator);
        Ok(RemovedMusic {
            music,
            playlists: affected,
        })
    }

    pub fn remove_music_by_locator(&mut self, locator: &str) -> Result<RemovedMusic, IndexError> {
        let id = self
            .music_by_locator
            .get(locator)
            .cloned()
            .ok_or_else(|| IndexError::not_found("music", locator))?;
        self.remove_music(&id)
    }

    fn insert_music_views(&mut self, id: &MusicId, liked: bool) {
        let music = &self.music;
        let by_title = |left: &MusicId, right: &MusicId| {
            compare_in(music, left, right, |left, right| {
                compare_music(left, right, MusicSort::Title, SortDirection::Ascending)
            })
        };
        insert_sorted(Arc::make_mut(&mut self.views.music_by_title), id.clone(), by_title);
        if liked {
            insert_sorted(Arc::make_mut(&mut self.views.liked_by_title), id.clone(), by_title);
        }
    }

    fn remove_music_views(&mut self, id: &MusicId) {
        remove_from_view(Arc::make_mut(&mut self.views.music_by_title), id);
        if self.views.liked_by_title.contains(id) {
            remove_from_view(Arc::make_mut(&mut self.views.liked_by_title), id);
        }
    }

    // ---------------------------------------------------------------------
    // Folders
    // ---------------------------------------------------------------------

    fn parent_folder_path(&self, dir: &Path) -> Option<PathBuf> {
        if self.library_roots.iter().any(|root| root == dir) {
            return None;
        }
        dir.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    fn ensure_folder_chain(&mut self, dir: &Path) -> FolderId {
        if let Some(id) = self.folder_by_path.get(dir) {
            return *id;
        }

        let parent = self
            .parent_folder_path(dir)
            .map(|parent_path| self.ensure_folder_chain(&parent_path));
        let id = FolderId(self.next_folder_id);
        self.next_folder_id += 1;
        let folder = Folder {
            id,
            path: dir.to_path_buf(),
            title: folder_title(dir),
            parent,
            ..Folder::default()
        };
        Arc::make_mut(&mut self.folders).insert(id, Arc::new(folder));
        Arc::make_mut(&mut self.folder_by_path).insert(dir.to_path_buf(), id);

        match parent {
            Some(parent_id) => {
                let mut children = self
                    .folders
                    .get(&parent_id)
                    .map(|parent| parent.children.clone())
                    .unwrap_or_default();
                let folders = &self.folders;
                insert_sorted(&mut children, id, |left, right| {
                    compare_in(folders, left, right, compare_folders)
                });
                if let Some(parent) = Arc::make_mut(&mut self.folders).get_mut(&parent_id) {
                    Arc::make_mut(parent).children = children;
                }
            }
            None => {
                let folders = &self.folders;
                insert_sorted(Arc::make_mut(&mut self.views.root_folders), id, |left, right| {
                    compare_in(folders, left, right, compare_folders)
                });
            }
        }
        id
    }

    fn link_folder(&mut self, music_id: &MusicId, dir: &Path) -> FolderId {
        let folder_id = self.ensure_folder_chain(dir);
        if let Some(folder) = Arc::make_mut(&mut self.folders).get_mut(&folder_id) {
            Arc::make_mut(folder).music.insert(music_id.clone());
        }
        self.adjust_subtree_counts(folder_id, 1);
        folder_id
    }

    fn unlink_folder(&mut self, music_id: &MusicId, folder_id: FolderId) {
        let removed = Arc::make_mut(&mut self.folders)
            .get_mut(&folder_id)
            .map(|folder| Arc::make_mut(folder).music.remove(music_id))
            .unwrap_or(false);
        if removed {
            self.adjust_subtree_counts(folder_id, -1);
        }
        self.collect_empty_folders(folder_id);
    }

    /// Walks from `start` to its root adjusting subtree counts.
    fn adjust_subtree_counts(&mut self, start: FolderId, delta: isize) {
        let folders = Arc::make_mut(&mut self.folders);
        let limit = folders.len();
        let mut cursor = Some(start);
        let mut steps = 0usize;
        while let Some(id) = cursor {
            steps += 1;
            if steps > limit {
                debug_assert!(false, "folder cycle detected at {:?}", id);
                error!("Folder cycle detected at {:?}; stopping count update", id);
                break;
            }
            let Some(folder) = folders.get_mut(&id) else {
                break;
            };
            let folder = Arc::make_mut(folder);
            folder.subtree_music_count = folder.subtree_music_count.saturating_add_signed(delta);
            cursor = folder.parent;
        }
    }

    fn collect_empty_folders(&mut self, start: FolderId) {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let Some(folder) = self.folders.get(&id).cloned() else {
                break;
            };
            if !folder.music.is_empty() || !folder.children.is_empty() {
                break;
            }
            let folders = Arc::make_mut(&mut self.folders);
            folders.remove(&id);
            Arc::make_mut(&mut self.folder_by_path).remove(&folder.path);
            match folder.parent {
                Some(parent_id) => {
                    if let Some(parent) = folders.get_mut(&parent_id) {
                        remove_from_view(&mut Arc::make_mut(parent).children, &id);
                    }
                }
                None => {
                    remove_from_view(Arc::make_mut(&mut self.views.root_folders), &id);
                }
            }
            trace!("Collected empty folder {}", folder.path.display());
            cursor = folder.parent;
        }
    }

    // ---------------------------------------------------------------------
    // Artists, albums, genres
    // ---------------------------------------------------------------------

    fn ensure_artist(&mut self, key: &TextKey, title: &str) {
        if self.artists.contains_key(key) {
            return;
        }
        let artist = Artist {
            key: key.clone(),
            title: title.to_string(),
            ..Artist::default()
        };
        Arc::make_mut(&mut self.artists).insert(key.clone(), Arc::new(artist));
        let artists = &self.artists;
        insert_sorted(
            Arc::make_mut(&mut self.views.artists_by_title),
            key.clone(),
            |left, right| compare_in(artists, left, right, compare_artists),
        );
    }

    fn link_artist(&mut self, key: &TextKey, title: &str, music_id: &MusicId) {
        self.ensure_artist(key, title);
        if let Some(artist) = Arc::make_mut(&mut self.artists).get_mut(key) {
            Arc::make_mut(artist).music.insert(music_id.clone());
        }
    }

    fn unlink_artist(&mut self, key: &TextKey, music_id: &MusicId) {
        if let Some(artist) = Arc::make_mut(&mut self.artists).get_mut(key) {
            Arc::make_mut(artist).music.remove(music_id);
        }
        self.collect_artist(key);
    }

    fn collect_artist(&mut self, key: &TextKey) {
        let empty = self
            .artists
            .get(key)
            .map(|artist| artist.music.is_empty() && artist.albums.is_empty())
            .unwrap_or(false);
        if empty {
            Arc::make_mut(&mut self.artists).remove(key);
            remove_from_view(Arc::make_mut(&mut self.views.artists_by_title), key);
            trace!("Collected empty artist {:?}", key);
        }
    }

    fn link_album(&mut self, music: &Music) {
        if !self.albums.contains_key(&music.album_id) {
            let artist_key = TextKey::new(&music.album_artist_title);
            self.ensure_artist(&artist_key, &music.album_artist_title);
            if let Some(artist) = Arc::make_mut(&mut self.artists).get_mut(&artist_key) {
                Arc::make_mut(artist).albums.insert(music.album_id.clone());
            }
            let album = Album {
                id: music.album_id.clone(),
                title: music.album_title.clone(),
                artist_key,
                artist_title: music.album_artist_title.clone(),
                ..Album::default()
            };
            Arc::make_mut(&mut self.albums).insert(music.album_id.clone(), Arc::new(album));
            let albums = &self.albums;
            insert_sorted(
                Arc::make_mut(&mut self.views.albums_by_title),
                music.album_id.clone(),
                |left, right| {
                    compare_in(albums, left, right, |left, right| {
                        compare_albums(left, right, AlbumSort::Title, SortDirection::Ascending)
                    })
                },
            );
        }
        if let Some(album) = Arc::make_mut(&mut self.albums).get_mut(&music.album_id) {
            Arc::make_mut(album).music.insert(music.id.clone());
        }
        self.refresh_album_summary(&music.album_id);
    }

    fn unlink_album(&mut self, album_id: &AlbumId, music_id: &MusicId) {
        let Some(album) = Arc::make_mut(&mut self.albums).get_mut(album_id) else {
            return;
        };
        let album = Arc::make_mut(album);
        album.music.remove(music_id);
        if !album.music.is_empty() {
            self.refresh_album_summary(album_id);
            return;
        }

        let artist_key = album.artist_key.clone();
        Arc::make_mut(&mut self.albums).remove(album_id);
        remove_from_view(Arc::make_mut(&mut self.views.albums_by_title), album_id);
        if let Some(artist) = Arc::make_mut(&mut self.artists).get_mut(&artist_key) {
            Arc::make_mut(artist).albums.remove(album_id);
        }
        self.collect_artist(&artist_key);
        trace!("Collected empty album {:?}", album_id);
    }

    // Year and compilation flag are derived from the album's current tracks.
    fn refresh_album_summary(&mut self, album_id: &AlbumId) {
        let Some(album) = self.albums.get(album_id) else {
            return;
        };
        let members: Vec<&Arc<Music>> = album
            .music
            .iter()
            .filter_map(|id| self.music.get(id))
            .collect();
        let year = members.iter().filter_map(|music| music.year).min();
        let compilation = members.iter().any(|music| music.compilation);
        if album.year == year && album.compilation == compilation {
            return;
        }
        if let Some(album) = Arc::make_mut(&mut self.albums).get_mut(album_id) {
            let album = Arc::make_mut(album);
            album.year = year;
            album.compilation = compilation;
        }
    }

    fn link_genre(&mut self, key: &TextKey, title: &str, music_id: &MusicId) {
        if !self.genres.contains_key(key) {
            let genre = Genre {
                key: key.clone(),
                title: title.to_string(),
                ..Genre::default()
            };
            Arc::make_mut(&mut self.genres).insert(key.clone(), Arc::new(genre));
            let genres = &self.genres;
            insert_sorted(
                Arc::make_mut(&mut self.views.genres_by_title),
                key.clone(),
                |left, right| compare_in(genres, left, right, compare_genres),
            );
        }
        if let Some(genre) = Arc::make_mut(&mut self.genres).get_mut(key) {
            Arc::make_mut(genre).music.insert(music_id.clone());
        }
    }

    fn unlink_genre(&mut self, key: &TextKey, music_id: &MusicId) {
        let empty = match Arc::make_mut(&mut self.genres).get_mut(key) {
            Some(genre) => {
                let genre = Arc::make_mut(genre);
                genre.music.remove(music_id);
                genre.music.is_empty()
            }
            None => false,
        };
        if empty {
            Arc::make_mut(&mut self.genres).remove(key);
            remove_from_view(Arc::make_mut(&mut self.views.genres_by_title), key);
            trace!("Collected empty genre {:?}", key);
        }
    }

    // ---------------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------------

    pub fn music(&self, id: &MusicId) -> Result<Arc<Music>, IndexError> {
        self.music
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("music", id.as_str()))
    }

    pub fn music_by_locator(&self, locator: &str) -> Result<Arc<Music>, IndexError> {
        self.music_by_locator
            .get(locator)
            .and_then(|id| self.music.get(id))
            .cloned()
            .ok_or_else(|| IndexError::not_found("music", locator))
    }

    pub fn contains_music(&self, id: &MusicId) -> bool {
        self.music.contains_key(id)
    }

    pub fn folder(&self, id: FolderId) -> Result<Arc<Folder>, IndexError> {
        self.folders
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("folder", id.0.to_string()))
    }

    pub fn folder_by_path(&self, path: &Path) -> Result<Arc<Folder>, IndexError> {
        self.folder_by_path
            .get(path)
            .and_then(|id| self.folders.get(id))
            .cloned()
            .ok_or_else(|| IndexError::not_found("folder", path.display().to_string()))
    }

    pub fn artist(&self, title: &str) -> Result<Arc<Artist>, IndexError> {
        self.artists
            .get(&TextKey::new(title))
            .cloned()
            .ok_or_else(|| IndexError::not_found("artist", title))
    }

    pub fn album(&self, id: &AlbumId) -> Result<Arc<Album>, IndexError> {
        self.albums
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("album", id.as_str()))
    }

    /// Looks an album up by its title and album artist.
    pub fn album_by_title(
        &self,
        artist_title: &str,
        album_title: &str,
    ) -> Result<Arc<Album>, IndexError> {
        self.album(&AlbumId::new(
            &TextKey::new(artist_title),
            &TextKey::new(album_title),
        ))
    }

    pub fn genre(&self, title: &str) -> Result<Arc<Genre>, IndexError> {
        self.genres
            .get(&TextKey::new(title))
            .cloned()
            .ok_or_else(|| IndexError::not_found("genre", title))
    }

    pub fn playlist(&self, id: &PlaylistId) -> Result<Arc<Playlist>, IndexError> {
        if id.is_likes() {
            return Ok(Arc::new(self.likes_playlist()));
        }
        self.playlists
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::not_found("playlist", id.as_str()))
    }

    // ---------------------------------------------------------------------
    // Views and collections
    // ---------------------------------------------------------------------

    fn resolve_music(&self, ids: &[MusicId]) -> Vec<Arc<Music>> {
        ids.iter().filter_map(|id| self.music.get(id).cloned()).collect()
    }

    /// Every track, ordered by title.
    pub fn all_music(&self) -> Vec<Arc<Music>> {
        self.resolve_music(&self.views.music_by_title)
    }

    pub fn music_ids_by_title(&self) -> &[MusicId] {
        &self.views.music_by_title
    }

    pub fn liked_music(&self) -> Vec<Arc<Music>> {
        self.resolve_music(&self.views.liked_by_title)
    }

    pub fn artists(&self) -> Vec<Arc<Artist>> {
        self.views
            .artists_by_title
            .iter()
            .filter_map(|key| self.artists.get(key).cloned())
            .collect()
    }

    pub fn albums(&self) -> Vec<Arc<Album>> {
        self.views
            .albums_by_title
            .iter()
            .filter_map(|id| self.albums.get(id).cloned())
            .collect()
    }

    pub fn albums_sorted(&self, sort: AlbumSort, direction: SortDirection) -> Vec<Arc<Album>> {
        let mut albums = self.albums();
        albums.sort_by(|left, right| compare_albums(left, right, sort, direction));
        albums
    }

    pub fn genres(&self) -> Vec<Arc<Genre>> {
        self.views
            .genres_by_title
            .iter()
            .filter_map(|key| self.genres.get(key).cloned())
            .collect()
    }

    /// User playlists ordered by title. The virtual Likes playlist is not
    /// included; see [`MediaIndex::likes_playlist`].
    pub fn playlists(&self) -> Vec<Arc<Playlist>> {
        self.views
            .playlists_by_title
            .iter()
            .filter_map(|id| self.playlists.get(id).cloned())
            .collect()
    }

    pub fn playlists_sorted(
        &self,
        sort: PlaylistSort,
        direction: SortDirection,
    ) -> Vec<Arc<Playlist>> {
        let mut playlists = self.playlists();
        playlists.sort_by(|left, right| compare_playlists(left, right, sort, direction));
        playlists
    }

    /// The virtual playlist of liked tracks, ordered by title.
    pub fn likes_playlist(&self) -> Playlist {
        let entries = self
            .views
            .liked_by_title
            .iter()
            .filter_map(|id| self.music.get(id))
            .map(|music| PlaylistEntry {
                music_id: music.id.clone(),
                added_at_ms: self.liked_locators.get(&music.locator).copied().unwrap_or(0),
            })
            .collect();
        Playlist {
            id: PlaylistId::likes(),
            title: LIKES_PLAYLIST_TITLE.to_string(),
            created_at_ms: 0,
            entries,
        }
    }

    pub fn root_folders(&self) -> Vec<Arc<Folder>> {
        self.views
            .root_folders
            .iter()
            .filter_map(|id| self.folders.get(id).cloned())
            .collect()
    }

    pub fn child_folders(&self, id: FolderId) -> Result<Vec<Arc<Folder>>, IndexError> {
        let folder = self.folder(id)?;
        Ok(folder
            .children
            .iter()
            .filter_map(|child| self.folders.get(child).cloned())
            .collect())
    }

    /// Ids of every track in the folder and its descendants. Each folder is
    /// visited once, so the cost is proportional to the subtree.
    pub fn folder_music_ids(&self, id: FolderId) -> Result<Vec<MusicId>, IndexError> {
        let root = self.folder(id)?;
        let mut collected = Vec::with_capacity(root.subtree_music_count);
        let mut pending = vec![root];
        let mut visited = 0usize;
        while let Some(folder) = pending.pop() {
            visited += 1;
            if visited > self.folders.len() {
                debug_assert!(false, "folder cycle detected below {:?}", id);
                error!("Folder cycle detected below {:?}", id);
                break;
            }
            collected.extend(folder.music.iter().cloned());
            pending.extend(
                folder
                    .children
                    .iter()
                    .filter_map(|child| self.folders.get(child).cloned()),
            );
        }
        Ok(collected)
    }

    /// Tracks in the folder subtree, ordered by title.
    pub fn folder_music(&self, id: FolderId) -> Result<Vec<Arc<Music>>, IndexError> {
        let ids = self.folder_music_ids(id)?;
        Ok(self.sorted_music(&ids, MusicSort::Title, SortDirection::Ascending))
    }

    /// Tracks in playlist order. Entries whose track vanished are skipped.
    pub fn playlist_music(&self, id: &PlaylistId) -> Result<Vec<Arc<Music>>, IndexError> {
        let playlist = self.playlist(id)?;
        Ok(playlist
            .entries
            .iter()
            .filter_map(|entry| self.music.get(&entry.music_id).cloned())
            .collect())
    }

    /// Playlist tracks ordered by when they were added.
    pub fn playlist_music_by_added_date(
        &self,
        id: &PlaylistId,
        direction: SortDirection,
    ) -> Result<Vec<Arc<Music>>, IndexError> {
        let playlist = self.playlist(id)?;
        let mut entries: Vec<(Arc<Music>, i64)> = playlist
            .entries
            .iter()
            .filter_map(|entry| {
                self.music
                    .get(&entry.music_id)
                    .map(|music| (Arc::clone(music), entry.added_at_ms))
            })
            .collect();
        entries.sort_by(|left, right| {
            compare_playlist_entries((&*left.0, left.1), (&*right.0, right.1), direction)
        });
        Ok(entries.into_iter().map(|(music, _)| music).collect())
    }

    pub fn sorted_music(
        &self,
        ids: &[MusicId],
        sort: MusicSort,
        direction: SortDirection,
    ) -> Vec<Arc<Music>> {
        let unique: BTreeSet<&MusicId> = ids.iter().collect();
        let mut tracks: Vec<Arc<Music>> = unique
            .into_iter()
            .filter_map(|id| self.music.get(id).cloned())
            .collect();
        tracks.sort_by(|left, right| compare_music(left, right, sort, direction));
        tracks
    }

    /// Tracks an entity stands for, in the canonical order of its kind:
    /// artists by album, albums by disc/track, genres by artist, folders by
    /// title and playlists in playlist order.
    pub fn entity_music(&self, entity: &MediaEntity) -> Vec<Arc<Music>> {
        match entity {
            MediaEntity::Folder(folder) => self.folder_music(folder.id).unwrap_or_default(),
            MediaEntity::Artist(artist) => {
                let ids: Vec<MusicId> = artist.music.iter().cloned().collect();
                self.sorted_music(&ids, MusicSort::Artist, SortDirection::Ascending)
            }
            MediaEntity::Album(album) => {
                let ids: Vec<MusicId> = album.music.iter().cloned().collect();
                self.sorted_music(&ids, MusicSort::Album, SortDirection::Ascending)
            }
            MediaEntity::Genre(genre) => {
                let ids: Vec<MusicId> = genre.music.iter().cloned().collect();
                self.sorted_music(&ids, MusicSort::Genre, SortDirection::Ascending)
            }
            MediaEntity::Music(music) => self.music.get(&music.id).cloned().into_iter().collect(),
            MediaEntity::Playlist(playlist) => {
                self.playlist_music(&playlist.id).unwrap_or_default()
            }
        }
    }

    /// Case- and diacritic-insensitive substring search over titles.
    pub fn search(&self, query: &str) -> SearchResults {
        let needle = TextKey::new(query);
        if needle.as_str().is_empty() {
            return SearchResults::default();
        }
        let matches = |text: &str| TextKey::new(text).contains(&needle);

        let music_ids: Vec<MusicId> = self
            .music
            .values()
            .filter(|music| {
                matches(&music.title) || matches(&music.artist_title) || matches(&music.album_title)
            })
            .map(|music| music.id.clone())
            .collect();
        let artists = self
            .artists()
            .into_iter()
            .filter(|artist| matches(&artist.title))
            .collect();
        let albums = self
            .albums()
            .into_iter()
            .filter(|album| matches(&album.title) || matches(&album.artist_title))
            .collect();

        SearchResults {
            music: self.sorted_music(&music_ids, MusicSort::Title, SortDirection::Ascending),
            artists,
            albums,
        }
    }

    // ---------------------------------------------------------------------
    // Playlists and likes
    // ---------------------------------------------------------------------

    /// Fails with `DuplicateTitle` when another playlist (or the Likes
    /// playlist) already uses `title` case-insensitively.
    pub fn check_playlist_title(
        &self,
        title: &str,
        except: Option<&PlaylistId>,
    ) -> Result<String, IndexError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(IndexError::InvalidInput("playlist title is empty".to_string()));
        }
        let key = TextKey::new(title);
        let taken = key == TextKey::new(LIKES_PLAYLIST_TITLE)
            || self.playlists.values().any(|playlist| {
                Some(&playlist.id) != except && TextKey::new(&playlist.title) == key
            });
        if taken {
            return Err(IndexError::DuplicateTitle(title.to_string()));
        }
        Ok(title.to_string())
    }

    /// Adds an already validated playlist.
    pub fn insert_playlist(&mut self, playlist: Playlist) {
        let id = playlist.id.clone();
        Arc::make_mut(&mut self.playlists).insert(id.clone(), Arc::new(playlist));
        let playlists = &self.playlists;
        insert_sorted(
            Arc::make_mut(&mut self.views.playlists_by_title),
            id,
            |left, right| {
                compare_in(playlists, left, right, |left, right| {
                    compare_playlists(left, right, PlaylistSort::Title, SortDirection::Ascending)
                })
            },
        );
        self.bump_version();
    }

    pub fn create_playlist(&mut self, title: &str) -> Result<PlaylistId, IndexError> {
        let title = self.check_playlist_title(title, None)?;
        let id = PlaylistId::generate();
        self.insert_playlist(Playlist {
            id: id.clone(),
            title,
            created_at_ms: unix_now_ms(),
            entries: Vec::new(),
        });
        Ok(id)
    }

    pub fn rename_playlist(&mut self, id: &PlaylistId, title: &str) -> Result<(), IndexError> {
        if !self.playlists.contains_key(id) {
            return Err(IndexError::not_found("playlist", id.as_str()));
        }
        let title = self.check_playlist_title(title, Some(id))?;
        remove_from_view(Arc::make_mut(&mut self.views.playlists_by_title), id);
        if let Some(playlist) = Arc::make_mut(&mut self.playlists).get_mut(id) {
            Arc::make_mut(playlist).title = title;
        }
        let playlists = &self.playlists;
        insert_sorted(
            Arc::make_mut(&mut self.views.playlists_by_title),
            id.clone(),
            |left, right| {
                compare_in(playlists, left, right, |left, right| {
                    compare_playlists(left, right, PlaylistSort::Title, SortDirection::Ascending)
                })
            },
        );
        self.bump_version();
        Ok(())
    }

    pub fn delete_playlist(&mut self, id: &PlaylistId) -> Result<Arc<Playlist>, IndexError> {
        let removed = Arc::make_mut(&mut self.playlists)
            .remove(id)
            .ok_or_else(|| IndexError::not_found("playlist", id.as_str()))?;
        remove_from_view(Arc::make_mut(&mut self.views.playlists_by_title), id);
        self.bump_version();
        Ok(removed)
    }

    /// Appends tracks that are not yet in the playlist and returns the ones
    /// actually added. Adding to Likes likes the tracks.
    pub fn add_music_to_playlist(
        &mut self,
        id: &PlaylistId,
        music_ids: &[MusicId],
    ) -> Result<Vec<MusicId>, IndexError> {
        for music_id in music_ids {
            if !self.music.contains_key(music_id) {
                return Err(IndexError::not_found("music", music_id.as_str()));
            }
        }
        if id.is_likes() {
            let mut added = Vec::new();
            for music_id in music_ids {
                if self.set_liked(music_id, true)? {
                    added.push(music_id.clone());
                }
            }
            return Ok(added);
        }

        let Some(playlist) = Arc::make_mut(&mut self.playlists).get_mut(id) else {
            return Err(IndexError::not_found("playlist", id.as_str()));
        };
        let playlist = Arc::make_mut(playlist);
        let now = unix_now_ms();
        let mut added = Vec::new();
        for music_id in music_ids {
            if playlist.contains(music_id) || added.contains(music_id) {
                continue;
            }
            playlist.entries.push(PlaylistEntry {
                music_id: music_id.clone(),
                added_at_ms: now,
            });
            added.push(music_id.clone());
        }
        if !added.is_empty() {
            self.bump_version();
        }
        Ok(added)
    }

    /// Removes tracks from a playlist; tracks not in it are ignored.
    pub fn remove_music_from_playlist(
        &mut self,
        id: &PlaylistId,
        music_ids: &[MusicId],
    ) -> Result<Vec<MusicId>, IndexError> {
        if id.is_likes() {
            let mut removed = Vec::new();
            for music_id in music_ids {
                if self.music.contains_key(music_id) && self.set_liked(music_id, false)? {
                    removed.push(music_id.clone());
                }
            }
            return Ok(removed);
        }

        let Some(playlist) = Arc::make_mut(&mut self.playlists).get_mut(id) else {
            return Err(IndexError::not_found("playlist", id.as_str()));
        };
        let playlist = Arc::make_mut(playlist);
        let mut removed = Vec::new();
        playlist.entries.retain(|entry| {
            if music_ids.contains(&entry.music_id) {
                removed.push(entry.music_id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.bump_version();
        }
        Ok(removed)
    }

    /// Moves one playlist entry; `to` is clamped to the playlist length.
    pub fn move_playlist_entry(
        &mut self,
        id: &PlaylistId,
        from: usize,
        to: usize,
    ) -> Result<bool, IndexError> {
        let Some(playlist) = Arc::make_mut(&mut self.playlists).get_mut(id) else {
            return Err(IndexError::not_found("playlist", id.as_str()));
        };
        let playlist = Arc::make_mut(playlist);
        if from >= playlist.entries.len() {
            return Ok(false);
        }
        let to = to.min(playlist.entries.len() - 1);
        if from == to {
            return Ok(false);
        }
        let entry = playlist.entries.remove(from);
        playlist.entries.insert(to, entry);
        self.bump_version();
        Ok(true)
    }

    /// Sets the liked flag. Returns whether the flag changed.
    pub fn set_liked(&mut self, id: &MusicId, liked: bool) -> Result<bool, IndexError> {
        let current = self.music(id)?;
        if current.liked == liked {
            return Ok(false);
        }
        if liked {
            Arc::make_mut(&mut self.liked_locators).insert(current.locator.clone(), unix_now_ms());
        } else {
            Arc::make_mut(&mut self.liked_locators).remove(&current.locator);
        }
        if let Some(music) = Arc::make_mut(&mut self.music).get_mut(id) {
            Arc::make_mut(music).liked = liked;
        }
        if liked {
            let music = &self.music;
            insert_sorted(
                Arc::make_mut(&mut self.views.liked_by_title),
                id.clone(),
                |left, right| {
                    compare_in(music, left, right, |left, right| {
                        compare_music(left, right, MusicSort::Title, SortDirection::Ascending)
                    })
                },
            );
        } else {
            remove_from_view(Arc::make_mut(&mut self.views.liked_by_title), id);
        }
        self.bump_version();
        Ok(true)
    }

    /// Restores persisted liked flags keyed by locator. Locators not in the
    /// catalog are remembered for tracks that show up later.
    pub fn restore_liked(&mut self, liked: &[(String, i64)]) {
        for (locator, liked_at_ms) in liked {
            Arc::make_mut(&mut self.liked_locators).insert(locator.clone(), *liked_at_ms);
            let Some(id) = self.music_by_locator.get(locator).cloned() else {
                continue;
            };
            if let Some(music) = Arc::make_mut(&mut self.music).get_mut(&id) {
                if music.liked {
                    continue;
                }
                Arc::make_mut(music).liked = true;
            }
            let music = &self.music;
            insert_sorted(
                Arc::make_mut(&mut self.views.liked_by_title),
                id,
                |left, right| {
                    compare_in(music, left, right, |left, right| {
                        compare_music(left, right, MusicSort::Title, SortDirection::Ascending)
                    })
                },
            );
        }
        self.bump_version();
    }

    /// Restores a persisted playlist. Entries whose track is not in the
    /// catalog are pruned; their locators are returned so the caller can
    /// drop them from storage.
    pub fn restore_playlist(
        &mut self,
        restored: RestoredPlaylist,
    ) -> Result<Vec<String>, IndexError> {
        let title = self.check_playlist_title(&restored.title, Some(&restored.id))?;
        let mut pruned = Vec::new();
        let mut entries: Vec<PlaylistEntry> = Vec::with_capacity(restored.entries.len());
        for (locator, added_at_ms) in restored.entries {
            match self.music_by_locator.get(&locator) {
                Some(music_id) => {
                    if !entries.iter().any(|entry| &entry.music_id == music_id) {
                        entries.push(PlaylistEntry {
                            music_id: music_id.clone(),
                            added_at_ms,
                        });
                    }
                }
                None => pruned.push(locator),
            }
        }
        if self.playlists.contains_key(&restored.id) {
            remove_from_view(Arc::make_mut(&mut self.views.playlists_by_title), &restored.id);
        }
        self.insert_playlist(Playlist {
            id: restored.id,
            title,
            created_at_ms: restored.created_at_ms,
            entries,
        });
        Ok(pruned)
    }
}
