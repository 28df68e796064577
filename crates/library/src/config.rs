use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use common::FileEntry;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::LibraryError;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub version: u32,
    pub scan_paths: Vec<String>,
    pub index_path: String,
    pub audio_extensions: Vec<String>,
    pub playlist_extensions: Vec<String>,
    pub picture_extensions: Vec<String>,
    pub lyrics_extensions: Vec<String>,
    pub nfo_extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub artist_separator: String,
    pub various_artists_label: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            scan_paths: Vec::new(),
            index_path: "library.redb".to_string(),
            audio_extensions: strings(&[
                "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "wma", "ape",
                "wv", "mpc", "aif", "aiff",
            ]),
            playlist_extensions: strings(&["m3u", "m3u8", "pls", "cue", "strm"]),
            picture_extensions: strings(&["jpg", "jpeg", "png", "tbn", "gif", "bmp"]),
            lyrics_extensions: strings(&["lrc", "cdg"]),
            nfo_extensions: strings(&["nfo"]),
            exclude_patterns: Vec::new(),
            artist_separator: " / ".to_string(),
            various_artists_label: "Various Artists".to_string(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LIBRARY_SCAN_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ScanConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ScanConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "library.redb".to_string();
        }
        if config.artist_separator.is_empty() {
            config.artist_separator = " / ".to_string();
        }
        if config.various_artists_label.trim().is_empty() {
            config.various_artists_label = "Various Artists".to_string();
        }
        return Ok((config, false));
    }

    let config = ScanConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ScanConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

/// What the scanner makes of a listing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    Audio,
    Playlist,
    Picture,
    Lyrics,
    Nfo,
    Other,
}

/// `ScanConfig` compiled for lookups during a scan.
#[derive(Clone, Debug)]
pub struct ScanRules {
    audio: HashSet<String>,
    playlist: HashSet<String>,
    picture: HashSet<String>,
    lyrics: HashSet<String>,
    nfo: HashSet<String>,
    exclude: RegexSet,
    pub artist_separator: String,
    pub various_artists_label: String,
}

impl ScanRules {
    pub fn from_config(config: &ScanConfig) -> Result<Self, LibraryError> {
        Ok(Self {
            audio: extension_set(&config.audio_extensions),
            playlist: extension_set(&config.playlist_extensions),
            picture: extension_set(&config.picture_extensions),
            lyrics: extension_set(&config.lyrics_extensions),
            nfo: extension_set(&config.nfo_extensions),
            exclude: RegexSet::new(&config.exclude_patterns)?,
            artist_separator: config.artist_separator.clone(),
            various_artists_label: config.various_artists_label.clone(),
        })
    }

    pub fn kind(&self, entry: &FileEntry) -> EntryKind {
        if entry.is_dir {
            return EntryKind::Folder;
        }
        let ext = match entry.extension() {
            Some(ext) => ext,
            None => return EntryKind::Other,
        };
        // Playlists win over audio so a `.strm` or `.cue` never reaches the tag loader.
        if self.playlist.contains(&ext) {
            EntryKind::Playlist
        } else if self.nfo.contains(&ext) {
            EntryKind::Nfo
        } else if self.audio.contains(&ext) {
            EntryKind::Audio
        } else if self.picture.contains(&ext) {
            EntryKind::Picture
        } else if self.lyrics.contains(&ext) {
            EntryKind::Lyrics
        } else {
            EntryKind::Other
        }
    }

    pub fn is_audio_name(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .map(|ext| self.audio.contains(&ext.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or(false)
            && !self.is_playlist_name(name)
    }

    fn is_playlist_name(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                self.playlist.contains(&ext) || self.nfo.contains(&ext)
            })
            .unwrap_or(false)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude.is_match(path)
    }
}

impl Default for ScanRules {
    fn default() -> Self {
        let config = ScanConfig::default();
        Self {
            audio: extension_set(&config.audio_extensions),
            playlist: extension_set(&config.playlist_extensions),
            picture: extension_set(&config.picture_extensions),
            lyrics: extension_set(&config.lyrics_extensions),
            nfo: extension_set(&config.nfo_extensions),
            exclude: RegexSet::empty(),
            artist_separator: config.artist_separator,
            various_artists_label: config.various_artists_label,
        }
    }
}

fn extension_set(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|value| value.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::FileTime;

    fn file(label: &str) -> FileEntry {
        FileEntry {
            path: format!("/music/{}", label),
            label: label.to_string(),
            is_dir: false,
            size: 0,
            modified: FileTime::default(),
        }
    }

    #[test]
    fn entries_are_classified_by_extension() {
        let rules = ScanRules::default();
        assert_eq!(rules.kind(&file("01.FLAC")), EntryKind::Audio);
        assert_eq!(rules.kind(&file("album.cue")), EntryKind::Playlist);
        assert_eq!(rules.kind(&file("album.nfo")), EntryKind::Nfo);
        assert_eq!(rules.kind(&file("folder.jpg")), EntryKind::Picture);
        assert_eq!(rules.kind(&file("01.lrc")), EntryKind::Lyrics);
        assert_eq!(rules.kind(&file("README")), EntryKind::Other);
        let mut folder = file("Disc 1");
        folder.is_dir = true;
        assert_eq!(rules.kind(&folder), EntryKind::Folder);
    }

    #[test]
    fn extensions_are_normalized() {
        let config = ScanConfig {
            audio_extensions: vec![".MP3".to_string(), " ".to_string()],
            ..ScanConfig::default()
        };
        let rules = ScanRules::from_config(&config).unwrap();
        assert!(rules.is_audio_name("song.mp3"));
        assert!(!rules.is_audio_name("song.flac"));
    }

    #[test]
    fn bad_exclude_pattern_is_rejected() {
        let config = ScanConfig {
            exclude_patterns: vec!["([".to_string()],
            ..ScanConfig::default()
        };
        assert!(matches!(
            ScanRules::from_config(&config),
            Err(LibraryError::Pattern(_))
        ));
    }

    #[test]
    fn config_round_trips_through_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config.artist_separator, " / ");

        let mut edited = config.clone();
        edited.scan_paths = vec!["/srv/music".to_string()];
        edited.various_artists_label = String::new();
        save_config(&path, &edited).unwrap();

        let (loaded, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(loaded.scan_paths, vec!["/srv/music".to_string()]);
        assert_eq!(loaded.various_artists_label, "Various Artists");
    }

    #[test]
    fn relative_paths_resolve_next_to_config() {
        let config_path = Path::new("/etc/scanner/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            PathBuf::from("/etc/scanner/library.redb")
        );
        assert_eq!(resolve_path(config_path, "/var/lib/x.redb"), PathBuf::from("/var/lib/x.redb"));
    }
}
