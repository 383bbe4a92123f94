//! Catalog sources feeding raw track records into the library index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::CatalogError;
use crate::media_file_discovery::{self, FileStamp};
use crate::metadata_tags;

/// Raw track metadata as delivered by a catalog source. Every metadata field
/// is optional; the index substitutes placeholders for missing values.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrackRecord {
    /// Stable content identifier: absolute path or remote catalog id.
    pub locator: String,
    pub title: Option<String>,
    pub artist_title: Option<String>,
    pub album_title: Option<String>,
    pub album_artist_title: Option<String>,
    pub genre_title: Option<String>,
    pub duration_ms: Option<u64>,
    pub size_bytes: Option<u64>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<i32>,
    pub added_at_ms: Option<i64>,
    /// Playable path or URI; defaults to the locator.
    pub path_or_uri: Option<String>,
    pub artwork: Option<String>,
    #[serde(default)]
    pub compilation: bool,
    /// Remote catalog tracks have no folder.
    #[serde(default)]
    pub remote: bool,
}

/// Changes emitted by a catalog source.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    /// Full listing delivered by the first scan.
    Batch(Vec<TrackRecord>),
    Upsert(TrackRecord),
    Remove { locator: String },
}

/// Something that can enumerate tracks: the local file system or a remote
/// catalog adapter. The first scan yields a `Batch`; later scans yield
/// incremental events.
pub trait CatalogSource: Send {
    fn name(&self) -> &str;
    fn scan(&mut self) -> Result<Vec<CatalogEvent>, CatalogError>;
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Builds a record for a local file from its tags, falling back to an
/// all-placeholder record when the tags cannot be read.
pub fn record_for_local_file(path: &Path, stamp: FileStamp) -> TrackRecord {
    let locator = path.to_string_lossy().to_string();
    let tags = metadata_tags::read_track_tags(path).unwrap_or_else(|| {
        debug!("No readable tags in {}", path.display());
        Default::default()
    });
    TrackRecord {
        locator: locator.clone(),
        title: non_empty(tags.title),
        artist_title: non_empty(tags.artist),
        album_title: non_empty(tags.album),
        album_artist_title: non_empty(tags.album_artist),
        genre_title: non_empty(tags.genre),
        duration_ms: Some(tags.duration_ms),
        size_bytes: Some(stamp.size_bytes),
        track_number: tags.track_number,
        disc_number: tags.disc_number,
        year: tags.year,
        added_at_ms: Some(stamp.modified_ms),
        path_or_uri: Some(locator),
        artwork: None,
        compilation: false,
        remote: false,
    }
}

/// Scans configured library folders. Rescans diff against the previous scan
/// by file size and modification time.
pub struct LocalFolderSource {
    folders: Vec<PathBuf>,
    known_files: HashMap<PathBuf, FileStamp>,
    initial_scan_done: bool,
}

impl LocalFolderSource {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self {
            folders,
            known_files: HashMap::new(),
            initial_scan_done: false,
        }
    }

    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }
}

impl CatalogSource for LocalFolderSource {
    fn name(&self) -> &str {
        "local"
    }

    fn scan(&mut self) -> Result<Vec<CatalogEvent>, CatalogError> {
        // An unreadable root (e.g. unmounted storage) must not look like
        // every track under it was deleted.
        for folder in &self.folders {
            if let Err(source) = std::fs::read_dir(folder) {
                return Err(CatalogError::Io {
                    path: folder.display().to_string(),
                    source,
                });
            }
        }

        let mut discovered: HashMap<PathBuf, FileStamp> = HashMap::new();
        for folder in &self.folders {
            for file in media_file_discovery::collect_audio_files_from_folder(folder) {
                discovered.insert(file.path, file.stamp);
            }
        }

        let mut paths: Vec<&PathBuf> = discovered.keys().collect();
        paths.sort_unstable();

        let events = if !self.initial_scan_done {
            let records = paths
                .iter()
                .map(|path| record_for_local_file(path, discovered[*path]))
                .collect::<Vec<_>>();
            info!("Local scan found {} tracks", records.len());
            vec![CatalogEvent::Batch(records)]
        } else {
            let mut events = Vec::new();
            for path in &paths {
                let stamp = discovered[*path];
                if self.known_files.get(*path) != Some(&stamp) {
                    events.push(CatalogEvent::Upsert(record_for_local_file(path, stamp)));
                }
            }
            let mut vanished: Vec<&PathBuf> = self
                .known_files
                .keys()
                .filter(|path| !discovered.contains_key(*path))
                .collect();
            vanished.sort_unstable();
            for path in vanished {
                events.push(CatalogEvent::Remove {
                    locator: path.to_string_lossy().to_string(),
                });
            }
            if !events.is_empty() {
                info!("Local rescan produced {} changes", events.len());
            }
            events
        };

        if self.folders.is_empty() {
            warn!("Local scan requested with no library folders configured");
        }
        self.known_files = discovered;
        self.initial_scan_done = true;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, bytes).expect("write file");
    }

    #[test]
    fn test_first_scan_emits_batch_with_placeholder_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(&dir.path().join("a/one.mp3"), b"not really audio");

        let mut source = LocalFolderSource::new(vec![dir.path().to_path_buf()]);
        let events = source.scan().expect("scan");
        assert_eq!(events.len(), 1);
        let CatalogEvent::Batch(records) = &events[0] else {
            panic!("expected batch");
        };
        assert_eq!(records.len(), 1);
        assert!(records[0].locator.ends_with("one.mp3"));
        assert_eq!(records[0].artist_title, None);
        assert_eq!(records[0].size_bytes, Some(16));
        assert!(!records[0].remote);
    }

    #[test]
    fn test_rescan_emits_incremental_upserts_and_removes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("one.mp3");
        let second = dir.path().join("two.mp3");
        write_file(&first, b"1");
        write_file(&second, b"2");

        let mut source = LocalFolderSource::new(vec![dir.path().to_path_buf()]);
        source.scan().expect("initial scan");
        assert!(source.scan().expect("unchanged rescan").is_empty());

        std::fs::remove_file(&first).expect("remove");
        write_file(&second, b"longer content");
        let third = dir.path().join("three.flac");
        write_file(&third, b"3");

        let events = source.scan().expect("rescan");
        let upserts: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                CatalogEvent::Upsert(record) => Some(record.locator.as_str()),
                _ => None,
            })
            .collect();
        let removes: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                CatalogEvent::Remove { locator } => Some(locator.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(upserts.len(), 2);
        assert!(upserts.iter().any(|locator| locator.ends_with("two.mp3")));
        assert!(upserts.iter().any(|locator| locator.ends_with("three.flac")));
        assert_eq!(removes.len(), 1);
        assert!(removes[0].ends_with("one.mp3"));
    }

    #[test]
    fn test_missing_root_fails_without_emitting_removals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("library");
        write_file(&root.join("one.mp3"), b"1");

        let mut source = LocalFolderSource::new(vec![root.clone()]);
        source.scan().expect("initial scan");
        std::fs::remove_dir_all(&root).expect("remove root");

        assert!(matches!(source.scan(), Err(CatalogError::Io { .. })));
    }
}
