use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Modification time as stored on disk, split so it hashes and serializes
/// without depending on the platform's `SystemTime` layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileTime {
    pub secs: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self {
                secs: after.as_secs().min(i64::MAX as u64) as i64,
                nanos: after.subsec_nanos(),
            },
            Err(err) => {
                // floored: secs counts down, nanos always counts up from it
                let before = err.duration();
                let secs = -(before.as_secs().min(i64::MAX as u64 - 1) as i64);
                match before.subsec_nanos() {
                    0 => Self { secs, nanos: 0 },
                    nanos => Self {
                        secs: secs - 1,
                        nanos: 1_000_000_000 - nanos,
                    },
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub label: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: FileTime,
}

impl FileEntry {
    pub fn extension(&self) -> Option<String> {
        if self.is_dir {
            return None;
        }
        Path::new(&self.label)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// Entries of one directory, in label order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    entries: Vec<FileEntry>,
}

impl DirectoryListing {
    pub fn new(mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.label.cmp(&b.label))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathFingerprint(pub [u8; 16]);

impl PathFingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PathFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    pub id: String,
    pub path: String,
    pub directory: String,
    pub title: String,
    pub album: String,
    pub artist: String,
    pub album_artist: String,
    pub track: u32,
    pub disc: u16,
    pub year: Option<i32>,
    pub duration_ms: u32,
    #[serde(default)]
    pub genres: Vec<String>,
    pub file_size: u64,
    pub modified: FileTime,
    #[serde(default)]
    pub times_played: u32,
    #[serde(default)]
    pub last_played: Option<u64>,
    #[serde(default)]
    pub rating: u8,
}

impl SongRecord {
    /// Copies the fields that only exist in the database from a record the
    /// store held for the same path before this rescan.
    pub fn carry_over(&mut self, previous: &SongRecord) {
        self.times_played = previous.times_played;
        self.last_played = previous.last_played;
        if self.rating == 0 {
            self.rating = previous.rating;
        }
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Key a path is stored under. Separators are normalized to `/` so the
/// same folder maps to the same key on every platform.
pub fn path_key(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
