use std::path::Path;

use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use tracing::debug;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub duration_ms: Option<u32>,
    pub genres: Vec<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    NoTag,
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::NoTag => write!(f, "no tag found"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Source of per-file tags for the scanner.
///
/// Implementations never fail across this boundary: an unsupported or
/// corrupt file is reported as `None` and the scanner skips it.
pub trait TagLoader: Send + Sync {
    fn try_load(&self, path: &Path) -> Option<TagInfo>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagLoader;

impl TagLoader for LoftyTagLoader {
    fn try_load(&self, path: &Path) -> Option<TagInfo> {
        match read_tags(path) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!("No tag loaded for {:?}: {}", path, err);
                None
            }
        }
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }

    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
        .ok_or(MetadataError::NoTag)?;

    info.title = non_empty(tag.get_string(&ItemKey::TrackTitle));
    info.album = non_empty(tag.get_string(&ItemKey::AlbumTitle));
    info.artist = non_empty(tag.get_string(&ItemKey::TrackArtist));
    info.album_artist = non_empty(tag.get_string(&ItemKey::AlbumArtist));
    info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
    info.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
    info.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
    if let Some(value) = tag.get_string(&ItemKey::Genre) {
        info.genres = parse_genres(value);
    }

    Ok(info)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}
