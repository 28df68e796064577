mod classify;
mod config;
mod db;
mod error;
mod hasher;
mod session;
mod store;
mod walker;

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::{path_key, SongRecord};
use metadata::{LoftyTagLoader, TagLoader};
use parking_lot::Mutex;
use redb::Database;
use tracing::{info, warn};

pub use classify::{classify, split_artists};
pub use config::{
    config_path_from_env, load_or_create_config, resolve_path, save_config, ConfigError,
    EntryKind, ScanConfig, ScanRules, CONFIG_VERSION,
};
pub use db::{LibraryStats, RedbStore};
pub use error::LibraryError;
pub use hasher::compute_hash;
pub use session::{
    LogObserver, ScanObserver, ScanPhase, ScanProgress, ScanSession, SilentObserver,
};
pub use store::LibraryStore;
pub use walker::{read_listing, run_scan, ScanOptions, ScanReport};

/// A scanned music library backed by a redb index.
#[derive(Clone)]
pub struct Library {
    db: Arc<Database>,
    rules: Arc<ScanRules>,
    loader: Arc<dyn TagLoader>,
    active: Arc<Mutex<Option<Arc<ScanSession>>>>,
}

impl Library {
    pub fn open(db_path: &Path, config: &ScanConfig) -> Result<Self, LibraryError> {
        let db = Self::open_db(db_path)?;
        let library = Self::open_with_db(db, config)?;
        info!("Opened library index at {:?}", db_path);
        Ok(library)
    }

    pub fn open_with_db(db: Arc<Database>, config: &ScanConfig) -> Result<Self, LibraryError> {
        match db::read_version(&db)? {
            Some(version) if version == db::INDEX_VERSION => {}
            Some(version) => {
                warn!("Index version mismatch ({}); clearing for a full rescan", version);
                db::reset_index(&db)?;
            }
            None => {
                info!("Index is empty; the next scan builds it");
            }
        }

        Ok(Self {
            db,
            rules: Arc::new(ScanRules::from_config(config)?),
            loader: Arc::new(LoftyTagLoader),
            active: Arc::new(Mutex::new(None)),
        })
    }

    /// Loads the YAML config at `config_path`, writing defaults there on
    /// first run, and opens the index it points at.
    pub fn from_config_path(config_path: &Path) -> Result<(Self, ScanConfig), LibraryError> {
        let (config, created) = load_or_create_config(config_path)?;
        if created {
            info!("Wrote default config to {:?}", config_path);
        }
        let index_path = resolve_path(config_path, &config.index_path);
        let library = Self::open(&index_path, &config)?;
        Ok((library, config))
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
        let db = db::open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    /// Replaces the tag reader used by later scans.
    pub fn with_loader(mut self, loader: Arc<dyn TagLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Starts a scan of `paths` on its own thread. An empty list rescans
    /// every root already in the index.
    pub fn start_scan(
        &self,
        paths: Vec<PathBuf>,
        options: ScanOptions,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<ScanHandle, LibraryError> {
        let roots = self.resolve_roots(&paths)?;
        let active = ActiveScan::claim(&self.active)?;
        let session = active.session();

        let library = self.clone();
        let join = thread::Builder::new()
            .name("library-scan".to_string())
            .spawn(move || {
                let active = active;
                library.run(&roots, options, &active.session, observer.as_ref())
            })?;

        Ok(ScanHandle { session, join })
    }

    /// Scans `paths` on the calling thread.
    pub fn scan(
        &self,
        paths: &[PathBuf],
        options: ScanOptions,
        observer: &dyn ScanObserver,
    ) -> Result<ScanReport, LibraryError> {
        let roots = self.resolve_roots(paths)?;
        let active = ActiveScan::claim(&self.active)?;
        self.run(&roots, options, &active.session, observer)
    }

    fn run(
        &self,
        roots: &[PathBuf],
        options: ScanOptions,
        session: &ScanSession,
        observer: &dyn ScanObserver,
    ) -> Result<ScanReport, LibraryError> {
        info!("Scanning {} library roots", roots.len());
        let mut store = RedbStore::new(Arc::clone(&self.db));
        run_scan(
            &mut store,
            self.loader.as_ref(),
            &self.rules,
            roots,
            options,
            session,
            observer,
        )
    }

    fn resolve_roots(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, LibraryError> {
        if paths.is_empty() {
            return self.root_paths();
        }
        Ok(paths.iter().map(|path| normalize_root(path)).collect())
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Asks the running scan to stop. Returns false when none is running.
    pub fn stop_scan(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        db::read_stats(&self.db)
    }

    pub fn get_song(&self, path: &str) -> Result<Option<SongRecord>, LibraryError> {
        db::read_song(&self.db, path)
    }

    pub fn songs_in_directory(&self, directory: &str) -> Result<Vec<SongRecord>, LibraryError> {
        db::read_directory_songs(&self.db, directory)
    }

    /// Songs ordered by album artist, album, disc and track. `search`
    /// matches case-insensitively against those fields and the title.
    pub fn list_songs(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SongRecord>, usize), LibraryError> {
        db::list_songs(&self.db, search, limit, offset)
    }

    pub fn stored_hash(&self, directory: &str) -> Result<Option<String>, LibraryError> {
        db::read_stored_hash(&self.db, directory)
    }

    /// Recorded folders whose parent is not recorded itself.
    pub fn root_paths(&self) -> Result<Vec<PathBuf>, LibraryError> {
        let directories: HashSet<String> = db::read_hashed_directories(&self.db)?
            .into_iter()
            .collect();
        let mut roots: Vec<String> = directories
            .iter()
            .filter(|directory| {
                Path::new(directory.as_str())
                    .parent()
                    .map(|parent| !directories.contains(&path_key(parent)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        roots.sort();
        Ok(roots.into_iter().map(PathBuf::from).collect())
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }
}

/// A scan running on a background thread.
pub struct ScanHandle {
    session: Arc<ScanSession>,
    join: JoinHandle<Result<ScanReport, LibraryError>>,
}

impl ScanHandle {
    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn progress(&self) -> ScanProgress {
        self.session.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn wait(self) -> Result<ScanReport, LibraryError> {
        self.join
            .join()
            .map_err(|_| LibraryError::ScanThread("scan thread panicked".to_string()))?
    }
}

/// Marks a library as busy for as long as it lives.
struct ActiveScan {
    slot: Arc<Mutex<Option<Arc<ScanSession>>>>,
    session: Arc<ScanSession>,
}

impl ActiveScan {
    fn claim(slot: &Arc<Mutex<Option<Arc<ScanSession>>>>) -> Result<Self, LibraryError> {
        let mut current = slot.lock();
        if current.is_some() {
            return Err(LibraryError::ScanInProgress);
        }
        let session = Arc::new(ScanSession::new());
        *current = Some(Arc::clone(&session));
        Ok(Self {
            slot: Arc::clone(slot),
            session,
        })
    }

    fn session(&self) -> Arc<ScanSession> {
        Arc::clone(&self.session)
    }
}

impl Drop for ActiveScan {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

fn normalize_root(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    absolute.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::TagInfo;
    use std::fs;

    struct TitleLoader {
        gate: Mutex<()>,
    }

    impl TagLoader for TitleLoader {
        fn try_load(&self, path: &Path) -> Option<TagInfo> {
            let _open = self.gate.lock();
            Some(TagInfo {
                album: Some("Album".to_string()),
                artist: Some("Artist".to_string()),
                track_no: path
                    .file_stem()
                    .and_then(|stem| stem.to_string_lossy().parse().ok()),
                ..TagInfo::default()
            })
        }
    }

    fn library_with_music() -> (tempfile::TempDir, PathBuf, Library, Arc<TitleLoader>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        fs::create_dir_all(root.join("Album")).unwrap();
        fs::write(root.join("Album").join("1.mp3"), b"one").unwrap();
        fs::write(root.join("Album").join("2.mp3"), b"two").unwrap();

        let loader = Arc::new(TitleLoader { gate: Mutex::new(()) });
        let library = Library::open(&dir.path().join("index.redb"), &ScanConfig::default())
            .unwrap()
            .with_loader(loader.clone());
        (dir, root, library, loader)
    }

    #[test]
    fn background_scan_fills_the_index() {
        let (_dir, root, library, _loader) = library_with_music();
        let handle = library
            .start_scan(vec![root.clone()], ScanOptions::default(), Arc::new(SilentObserver))
            .unwrap();
        let report = handle.wait().unwrap();

        assert_eq!(report.songs_added, 2);
        assert!(!library.is_scanning());
        assert_eq!(library.stats().unwrap().songs, 2);

        let album = path_key(&root.join("Album"));
        let songs = library.songs_in_directory(&album).unwrap();
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0].title, "1");
        assert!(library.stored_hash(&album).unwrap().is_some());
        let song = library.get_song(&songs[1].path).unwrap().unwrap();
        assert_eq!(song.track, 2);
    }

    #[test]
    fn empty_path_list_rescans_recorded_roots() {
        let (_dir, root, library, _loader) = library_with_music();
        library
            .scan(&[root.clone()], ScanOptions::default(), &SilentObserver)
            .unwrap();
        assert_eq!(library.root_paths().unwrap(), vec![root.clone()]);

        fs::write(root.join("Album").join("3.mp3"), b"three").unwrap();
        let report = library
            .scan(&[], ScanOptions::default(), &SilentObserver)
            .unwrap();
        assert_eq!(report.songs_added, 3);
        assert_eq!(library.stats().unwrap().songs, 3);
    }

    #[test]
    fn second_scan_is_rejected_while_one_runs() {
        let (_dir, root, library, loader) = library_with_music();
        let gate = loader.gate.lock();
        let handle = library
            .start_scan(vec![root.clone()], ScanOptions::default(), Arc::new(SilentObserver))
            .unwrap();

        assert!(library.is_scanning());
        assert!(matches!(
            library.scan(&[root], ScanOptions::default(), &SilentObserver),
            Err(LibraryError::ScanInProgress)
        ));
        assert!(library.stop_scan());
        drop(gate);

        let report = handle.wait().unwrap();
        assert!(report.cancelled);
        assert_eq!(library.stats().unwrap(), LibraryStats::default());
        assert!(!library.stop_scan());
    }

    #[test]
    fn list_songs_pages_and_searches() {
        let (_dir, root, library, _loader) = library_with_music();
        library
            .scan(&[root], ScanOptions::default(), &SilentObserver)
            .unwrap();

        let (page, total) = library.list_songs(None, 1, 1).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].track, 2);

        let (found, total) = library.list_songs(Some("ARTIST"), 10, 0).unwrap();
        assert_eq!((found.len(), total), (2, 2));
        let (none, total) = library.list_songs(Some("nothing"), 10, 0).unwrap();
        assert!(none.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn config_path_opens_the_index_next_to_it() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("conf").join("config.yaml");

        let (library, config) = Library::from_config_path(&config_path).unwrap();
        assert!(config_path.exists());
        assert!(dir.path().join("conf").join(&config.index_path).exists());
        assert_eq!(library.stats().unwrap(), LibraryStats::default());
    }

    #[test]
    fn broken_config_is_reported_as_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, "scan_paths: [unterminated").unwrap();

        assert!(matches!(
            Library::from_config_path(&config_path),
            Err(LibraryError::Config(ConfigError::Yaml(_)))
        ));
    }

    #[test]
    fn roots_are_normalized() {
        let root = normalize_root(Path::new("/srv/music/"));
        assert_eq!(root, PathBuf::from("/srv/music"));
        assert!(normalize_root(Path::new("music")).is_absolute());
    }
}
