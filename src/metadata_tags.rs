//! Tag readers backed by `lofty`, used by the local catalog source.

use std::path::Path;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::{ItemKey, Tag};

/// Metadata values extracted from file tags. Empty strings and `None` mean
/// the tag was absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub genre: String,
    pub year: Option<i32>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_ms: u64,
}

fn first_non_empty_value<F>(primary_tag: Option<&Tag>, tags: &[Tag], mut extractor: F) -> String
where
    F: FnMut(&Tag) -> Option<String>,
{
    if let Some(tag) = primary_tag {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    for tag in tags {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    String::new()
}

/// Parses values like `"3"`, `"03/12"` or `" 7 "`.
pub(crate) fn parse_position_number(value: &str) -> Option<u32> {
    value
        .split('/')
        .next()
        .map(str::trim)
        .and_then(|number| number.parse::<u32>().ok())
        .filter(|number| *number > 0)
}

/// Extracts a four digit year from a date value such as `"1998-10-31"`.
pub(crate) fn parse_year(date: &str) -> Option<i32> {
    let year: String = date.trim().chars().take(4).collect();
    if year.chars().count() == 4 {
        year.parse::<i32>().ok()
    } else {
        None
    }
}

/// Reads tag values and duration from a media file.
pub fn read_track_tags(path: &Path) -> Option<TrackTags> {
    let tagged_file = read_from_path(path).ok()?;
    let duration_ms = tagged_file.properties().duration().as_millis() as u64;
    let primary_tag = tagged_file.primary_tag();
    let tags = tagged_file.tags();

    let title = first_non_empty_value(primary_tag, tags, |tag| {
        tag.title().map(|value| value.into_owned())
    });
    let artist = first_non_empty_value(primary_tag, tags, |tag| {
        tag.artist().map(|value| value.into_owned())
    });
    let album = first_non_empty_value(primary_tag, tags, |tag| {
        tag.album().map(|value| value.into_owned())
    });
    let album_artist = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::AlbumArtist).map(str::to_string)
    });
    let genre = first_non_empty_value(primary_tag, tags, |tag| {
        tag.genre().map(|value| value.into_owned())
    });
    let date = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::Year)
            .or_else(|| tag.get_string(ItemKey::RecordingDate))
            .or_else(|| tag.get_string(ItemKey::OriginalReleaseDate))
            .map(str::to_string)
    });
    let track_number = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::TrackNumber)
            .map(str::to_string)
            .or_else(|| tag.track().map(|value| value.to_string()))
    });
    let disc_number = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::DiscNumber).map(str::to_string)
    });

    Some(TrackTags {
        title,
        artist,
        album,
        album_artist,
        genre,
        year: parse_year(&date),
        track_number: parse_position_number(&track_number),
        disc_number: parse_position_number(&disc_number),
        duration_ms,
    })
}
