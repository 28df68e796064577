use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::SongRecord;
use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LibraryError;
use crate::store::LibraryStore;

pub(crate) const INDEX_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SONGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("songs");
const DIRECTORY_SONGS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("directory_songs");
const SONGS_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("songs_by_name");
const PATH_HASHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("path_hashes");

const META_VERSION_KEY: &str = "version";
const META_STATS_KEY: &str = "stats";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub songs: usize,
    pub directories: usize,
}

/// Writes made since `begin`, applied in one redb transaction on `commit`.
/// `None` marks a removal.
#[derive(Debug, Default)]
struct Staged {
    songs: BTreeMap<String, Option<SongRecord>>,
    hashes: BTreeMap<String, Option<String>>,
}

pub struct RedbStore {
    db: Arc<Database>,
    staged: Option<Staged>,
}

impl RedbStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, staged: None }
    }

    fn staged_mut(&mut self) -> Result<&mut Staged, LibraryError> {
        self.staged.as_mut().ok_or(LibraryError::NoTransaction)
    }
}

impl LibraryStore for RedbStore {
    fn begin(&mut self) -> Result<(), LibraryError> {
        if self.staged.is_some() {
            warn!("Discarding uncommitted scan writes");
        }
        self.staged = Some(Staged::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), LibraryError> {
        let staged = self.staged.take().ok_or(LibraryError::NoTransaction)?;
        let songs = staged.songs.len();
        let hashes = staged.hashes.len();
        let stats = apply_staged(&self.db, staged)?;
        info!(
            "Committed {} song and {} path changes ({} songs in {} folders)",
            songs, hashes, stats.songs, stats.directories
        );
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), LibraryError> {
        if let Some(staged) = self.staged.take() {
            debug!(
                "Rolled back {} song and {} path changes",
                staged.songs.len(),
                staged.hashes.len()
            );
        }
        Ok(())
    }

    fn stored_hash(&self, directory: &str) -> Result<Option<String>, LibraryError> {
        if let Some(staged) = &self.staged {
            if let Some(hash) = staged.hashes.get(directory) {
                return Ok(hash.clone());
            }
        }
        read_stored_hash(&self.db, directory)
    }

    fn set_stored_hash(&mut self, directory: &str, hash: &str) -> Result<(), LibraryError> {
        self.staged_mut()?
            .hashes
            .insert(directory.to_string(), Some(hash.to_string()));
        Ok(())
    }

    fn remove_stored_hash(&mut self, directory: &str) -> Result<(), LibraryError> {
        self.staged_mut()?.hashes.insert(directory.to_string(), None);
        Ok(())
    }

    fn upsert_song(&mut self, song: &SongRecord) -> Result<(), LibraryError> {
        self.staged_mut()?
            .songs
            .insert(song.path.clone(), Some(song.clone()));
        Ok(())
    }

    fn remove_songs_under_path(
        &mut self,
        directory: &str,
    ) -> Result<HashMap<String, SongRecord>, LibraryError> {
        let stored = read_directory_songs(&self.db, directory)?;
        let staged = self.staged_mut()?;

        let mut removed = HashMap::new();
        for song in stored {
            if !staged.songs.contains_key(&song.path) {
                removed.insert(song.path.clone(), song);
            }
        }
        for song in staged.songs.values().flatten() {
            if song.directory == directory {
                removed.insert(song.path.clone(), song.clone());
            }
        }
        for path in removed.keys() {
            staged.songs.insert(path.clone(), None);
        }
        Ok(removed)
    }

    fn cleanup_orphans(&mut self) -> Result<usize, LibraryError> {
        // `recorded` still holds folders dropped earlier in this scan, so
        // their vanished sub-folders are recognised as part of the library
        let mut recorded: HashSet<String> =
            read_hashed_directories(&self.db)?.into_iter().collect();
        let mut known = recorded.clone();
        {
            let staged = self.staged_mut()?;
            for (directory, hash) in &staged.hashes {
                match hash {
                    Some(_) => {
                        recorded.insert(directory.clone());
                        known.insert(directory.clone());
                    }
                    None => {
                        known.remove(directory);
                    }
                }
            }
        }

        let mut missing: Vec<String> = known
            .iter()
            .filter(|directory| is_orphaned(directory, &recorded))
            .cloned()
            .collect();
        missing.sort();

        for directory in &missing {
            debug!("Removing vanished folder {}", directory);
            self.remove_songs_under_path(directory)?;
            self.remove_stored_hash(directory)?;
        }

        let mut vanished_songs = 0usize;
        for directory in known.iter().filter(|directory| !missing.contains(*directory)) {
            let stored = read_directory_songs(&self.db, directory)?;
            let staged = self.staged_mut()?;
            for song in stored {
                if staged.songs.contains_key(&song.path) || Path::new(&song.path).exists() {
                    continue;
                }
                debug!("Removing vanished song {}", song.path);
                staged.songs.insert(song.path, None);
                vanished_songs += 1;
            }
        }
        Ok(missing.len() + vanished_songs)
    }
}

/// A recorded folder is orphaned once it is gone while the nearest ancestor
/// that still exists is itself a recorded folder. An unmounted share whose
/// root vanished as a whole is left alone.
fn is_orphaned(directory: &str, known: &HashSet<String>) -> bool {
    let path = Path::new(directory);
    if path.exists() {
        return false;
    }
    let mut ancestor = path.parent();
    while let Some(current) = ancestor {
        if current.exists() {
            return known.contains(&common::path_key(current));
        }
        ancestor = current.parent();
    }
    false
}

fn apply_staged(db: &Database, staged: Staged) -> Result<LibraryStats, LibraryError> {
    let mut stats = read_stats(db)?;
    let write_txn = db.begin_write()?;

    {
        let mut meta_table = write_txn.open_table(META_TABLE)?;
        let mut songs_table = write_txn.open_table(SONGS_TABLE)?;
        let mut directory_songs_table = write_txn.open_table(DIRECTORY_SONGS_TABLE)?;
        let mut songs_by_name_table = write_txn.open_table(SONGS_BY_NAME_TABLE)?;
        let mut hashes_table = write_txn.open_table(PATH_HASHES_TABLE)?;

        for (path, song) in staged.songs {
            let previous: Option<SongRecord> = match songs_table.get(path.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(previous) = &previous {
                let dir_key = directory_song_key(&previous.directory, &previous.path);
                directory_songs_table.remove(dir_key.as_str())?;
                songs_by_name_table.remove(song_name_key(previous).as_str())?;
            }

            match song {
                Some(song) => {
                    let song_bytes = encode_value(&song)?;
                    songs_table.insert(path.as_str(), song_bytes.as_slice())?;
                    let dir_key = directory_song_key(&song.directory, &song.path);
                    directory_songs_table.insert(dir_key.as_str(), path.as_bytes())?;
                    let name_key = song_name_key(&song);
                    songs_by_name_table.insert(name_key.as_str(), path.as_bytes())?;
                    if previous.is_none() {
                        stats.songs += 1;
                    }
                }
                None => {
                    if previous.is_some() {
                        songs_table.remove(path.as_str())?;
                        stats.songs = stats.songs.saturating_sub(1);
                    }
                }
            }
        }

        for (directory, hash) in staged.hashes {
            match hash {
                Some(hash) => {
                    let prev = hashes_table.insert(directory.as_str(), hash.as_bytes())?;
                    if prev.is_none() {
                        stats.directories += 1;
                    }
                }
                None => {
                    let prev = hashes_table.remove(directory.as_str())?;
                    if prev.is_some() {
                        stats.directories = stats.directories.saturating_sub(1);
                    }
                }
            }
        }

        let version_bytes = encode_value(&INDEX_VERSION)?;
        meta_table.insert(META_VERSION_KEY, version_bytes.as_slice())?;
        let stats_bytes = encode_value(&stats)?;
        meta_table.insert(META_STATS_KEY, stats_bytes.as_slice())?;
    }

    write_txn.commit()?;
    Ok(stats)
}

pub(crate) fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

pub(crate) fn read_version(db: &Database) -> Result<Option<u32>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

/// Drops every table so the next scan rebuilds the index from scratch.
pub(crate) fn reset_index(db: &Database) -> Result<(), LibraryError> {
    let write_txn = db.begin_write()?;
    clear_table(&write_txn, META_TABLE)?;
    clear_table(&write_txn, SONGS_TABLE)?;
    clear_table(&write_txn, DIRECTORY_SONGS_TABLE)?;
    clear_table(&write_txn, SONGS_BY_NAME_TABLE)?;
    clear_table(&write_txn, PATH_HASHES_TABLE)?;
    write_txn.commit()?;
    Ok(())
}

pub(crate) fn read_stats(db: &Database) -> Result<LibraryStats, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(LibraryStats::default()),
        Err(err) => return Err(err.into()),
    };
    let stats = match table.get(META_STATS_KEY)? {
        Some(value) => decode_value(value.value())?,
        None => LibraryStats::default(),
    };
    Ok(stats)
}

pub(crate) fn read_stored_hash(
    db: &Database,
    directory: &str,
) -> Result<Option<String>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(PATH_HASHES_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let hash = match table.get(directory)? {
        Some(value) => Some(String::from_utf8_lossy(value.value()).into_owned()),
        None => None,
    };
    Ok(hash)
}

pub(crate) fn read_hashed_directories(db: &Database) -> Result<Vec<String>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(PATH_HASHES_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut directories = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        directories.push(entry.0.value().to_string());
    }
    Ok(directories)
}

pub(crate) fn read_song(db: &Database, path: &str) -> Result<Option<SongRecord>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(SONGS_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let song = match table.get(path)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(song)
}

/// Songs stored directly inside `directory`, in path order.
pub(crate) fn read_directory_songs(
    db: &Database,
    directory: &str,
) -> Result<Vec<SongRecord>, LibraryError> {
    let read_txn = db.begin_read()?;
    let directory_table = match read_txn.open_table(DIRECTORY_SONGS_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let song_table = read_txn.open_table(SONGS_TABLE)?;

    let prefix = prefix_key(directory);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');
    let mut songs = Vec::new();

    for entry in directory_table.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        let key = entry.0.value();
        let (_, path) = split_key_last(key)?;
        if let Some(value) = song_table.get(path)? {
            let song: SongRecord = decode_value(value.value())?;
            songs.push(song);
        }
    }

    Ok(songs)
}

pub(crate) fn list_songs(
    db: &Database,
    search: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<(Vec<SongRecord>, usize), LibraryError> {
    let search = search
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_lowercase());

    let read_txn = db.begin_read()?;
    let name_table = match read_txn.open_table(SONGS_BY_NAME_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };
    let song_table = read_txn.open_table(SONGS_TABLE)?;

    let mut total = 0usize;
    let mut items = Vec::new();

    for entry in name_table.iter()? {
        let entry = entry?;
        let key = entry.0.value();
        if let Some(search) = &search {
            let (name, _) = split_key_last(key)?;
            if !name.contains(search.as_str()) {
                continue;
            }
        }

        total += 1;
        if total <= offset {
            continue;
        }
        if items.len() >= limit {
            continue;
        }

        let path = String::from_utf8_lossy(entry.1.value()).into_owned();
        if let Some(value) = song_table.get(path.as_str())? {
            let song: SongRecord = decode_value(value.value())?;
            items.push(song);
        }
    }

    Ok((items, total))
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), LibraryError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn directory_song_key(directory: &str, path: &str) -> String {
    let mut out = prefix_key(directory);
    out.push_str(path);
    out
}

fn song_name_key(song: &SongRecord) -> String {
    let artist = if song.album_artist.is_empty() {
        &song.artist
    } else {
        &song.album_artist
    };
    let mut out = String::new();
    out.push_str(artist.trim().to_lowercase().as_str());
    out.push(KEY_SEP);
    out.push_str(&song.album.to_lowercase());
    out.push(KEY_SEP);
    out.push_str(&format!("{:05}", song.disc));
    out.push(KEY_SEP);
    out.push_str(&format!("{:010}", song.track));
    out.push(KEY_SEP);
    out.push_str(&song.title.to_lowercase());
    out.push(KEY_SEP);
    out.push_str(&song.path);
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}
