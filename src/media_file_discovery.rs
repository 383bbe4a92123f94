use std::{
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use log::debug;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 9] =
    ["mp3", "wav", "ogg", "opus", "flac", "aac", "m4a", "mp4", "wma"];

/// Size and modification time of a discovered file, used to detect changes
/// between scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size_bytes: u64,
    pub modified_ms: i64,
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub stamp: FileStamp,
}

pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

fn stamp_for(entry: &std::fs::DirEntry) -> FileStamp {
    let metadata = entry.metadata().ok();
    let size_bytes = metadata.as_ref().map(|meta| meta.len()).unwrap_or(0);
    let modified_ms = metadata
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0);
    FileStamp {
        size_bytes,
        modified_ms,
    }
}

/// Walks `folder_path` and returns every supported audio file below it,
/// sorted by path. Unreadable subdirectories are skipped.
pub fn collect_audio_files_from_folder(folder_path: &Path) -> Vec<DiscoveredFile> {
    let mut pending_directories = vec![folder_path.to_path_buf()];
    let mut tracks = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Failed to read a directory entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Failed to inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                pending_directories.push(path);
                continue;
            }

            if file_type.is_file() && is_supported_audio_file(&path) {
                let stamp = stamp_for(&entry);
                tracks.push(DiscoveredFile { path, stamp });
            }
        }
    }

    tracks.sort_unstable_by(|left, right| left.path.cmp(&right.path));
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported_audio_file_ignores_case() {
        assert!(is_supported_audio_file(Path::new("/music/a.FLAC")));
        assert!(is_supported_audio_file(Path::new("song.mp3")));
        assert!(!is_supported_audio_file(Path::new("cover.jpg")));
        assert!(!is_supported_audio_file(Path::new("no_extension")));
    }

    #[test]
    fn test_collect_audio_files_walks_nested_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("Artist").join("Album");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(nested.join("02.mp3"), b"x").expect("write");
        std::fs::write(nested.join("01.mp3"), b"xy").expect("write");
        std::fs::write(nested.join("cover.jpg"), b"img").expect("write");
        std::fs::write(dir.path().join("loose.ogg"), b"xyz").expect("write");

        let files = collect_audio_files_from_folder(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|file| {
                file.path
                    .strip_prefix(dir.path())
                    .expect("inside root")
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(names, vec!["Artist/Album/01.mp3", "Artist/Album/02.mp3", "loose.ogg"]);
        assert_eq!(files[0].stamp.size_bytes, 2);
    }
}
