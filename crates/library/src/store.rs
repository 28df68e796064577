use std::collections::HashMap;

use common::SongRecord;

use crate::error::LibraryError;

/// Persistence used by the scanner.
///
/// Writes happen between `begin` and `commit`/`rollback`, which wrap a whole
/// top-level scan rather than a single directory.
pub trait LibraryStore {
    fn begin(&mut self) -> Result<(), LibraryError>;
    fn commit(&mut self) -> Result<(), LibraryError>;
    fn rollback(&mut self) -> Result<(), LibraryError>;

    fn stored_hash(&self, directory: &str) -> Result<Option<String>, LibraryError>;
    fn set_stored_hash(&mut self, directory: &str, hash: &str) -> Result<(), LibraryError>;
    fn remove_stored_hash(&mut self, directory: &str) -> Result<(), LibraryError>;

    /// Inserts or replaces the song stored under `song.path`.
    fn upsert_song(&mut self, song: &SongRecord) -> Result<(), LibraryError>;

    /// Removes every song directly inside `directory` and returns them keyed
    /// by path, so a rescan can carry their database-only fields over.
    fn remove_songs_under_path(
        &mut self,
        directory: &str,
    ) -> Result<HashMap<String, SongRecord>, LibraryError>;

    /// Drops hashes and songs of recorded directories that no longer exist,
    /// and songs whose file is gone from a folder that still does. Returns
    /// the number of folders and songs dropped.
    fn cleanup_orphans(&mut self) -> Result<usize, LibraryError>;
}
