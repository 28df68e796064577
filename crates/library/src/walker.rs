use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use common::{path_key, stable_id, DirectoryListing, FileEntry, FileTime, SongRecord};
use metadata::{TagInfo, TagLoader};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::classify::classify;
use crate::config::{EntryKind, ScanRules};
use crate::error::LibraryError;
use crate::hasher::compute_hash;
use crate::session::{ScanObserver, ScanPhase, ScanSession};
use crate::store::LibraryStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Re-extract every folder even when its stored hash still matches.
    pub force_rescan: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub cancelled: bool,
    pub directories_scanned: usize,
    pub directories_skipped: usize,
    /// Recorded folders found empty; their songs and hash were dropped.
    pub directories_emptied: usize,
    pub songs_added: usize,
    pub tags_missing: usize,
    pub orphans_removed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

/// Scans `roots` into `store` as one transaction.
///
/// A stopped session rolls every write back and reports `cancelled`. A store
/// error rolls back as well and is returned.
pub fn run_scan<S: LibraryStore + ?Sized>(
    store: &mut S,
    loader: &dyn TagLoader,
    rules: &ScanRules,
    roots: &[PathBuf],
    options: ScanOptions,
    session: &ScanSession,
    observer: &dyn ScanObserver,
) -> Result<ScanReport, LibraryError> {
    let started = Instant::now();
    let walking_done = AtomicBool::new(false);

    let result = thread::scope(|scope| {
        let counter = thread::Builder::new()
            .name("library-count".to_string())
            .spawn_scoped(scope, || count_files(roots, rules, session, &walking_done));
        if let Err(err) = counter {
            warn!("Failed to start file counter: {}", err);
        }

        let result = scan_roots(store, loader, rules, roots, options, session, observer);
        walking_done.store(true, Ordering::Relaxed);
        result
    });

    match &result {
        Ok(report) if report.cancelled => {
            info!("Library scan cancelled after {:.2?}", started.elapsed());
        }
        Ok(report) => {
            info!(
                "Library scan took {:.2?} ({} folders scanned, {} unchanged, {} songs)",
                started.elapsed(),
                report.directories_scanned,
                report.directories_skipped,
                report.songs_added
            );
        }
        Err(err) => {
            warn!("Library scan failed after {:.2?}: {}", started.elapsed(), err);
        }
    }
    observer.on_finished();
    result
}

fn scan_roots<S: LibraryStore + ?Sized>(
    store: &mut S,
    loader: &dyn TagLoader,
    rules: &ScanRules,
    roots: &[PathBuf],
    options: ScanOptions,
    session: &ScanSession,
    observer: &dyn ScanObserver,
) -> Result<ScanReport, LibraryError> {
    observer.on_state_changed(ScanPhase::Scanning);
    store.begin()?;

    let (outcome, mut report) = {
        let mut walker = Walker {
            store: &mut *store,
            loader,
            rules,
            options,
            session,
            observer,
            report: ScanReport::default(),
        };
        let outcome = walker.scan_all(roots);
        (outcome, walker.report)
    };

    let finished = match outcome {
        Ok(Flow::Continue) => finish(store, &mut report, observer),
        Ok(Flow::Stopped) => {
            observer.on_state_changed(ScanPhase::RollingBack);
            store.rollback()?;
            report.cancelled = true;
            return Ok(report);
        }
        Err(err) => Err(err),
    };

    match finished {
        Ok(()) => Ok(report),
        Err(err) => {
            observer.on_state_changed(ScanPhase::RollingBack);
            if let Err(rollback_err) = store.rollback() {
                warn!("Rollback after failed scan also failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

fn finish<S: LibraryStore + ?Sized>(
    store: &mut S,
    report: &mut ScanReport,
    observer: &dyn ScanObserver,
) -> Result<(), LibraryError> {
    if report.directories_scanned > 0 || report.directories_emptied > 0 {
        observer.on_state_changed(ScanPhase::Cleaning);
        report.orphans_removed = store.cleanup_orphans()?;
        if report.orphans_removed > 0 {
            info!("Removed {} vanished folders and songs", report.orphans_removed);
        }
    }
    observer.on_state_changed(ScanPhase::Committing);
    store.commit()
}

struct Walker<'a, S: LibraryStore + ?Sized> {
    store: &'a mut S,
    loader: &'a dyn TagLoader,
    rules: &'a ScanRules,
    options: ScanOptions,
    session: &'a ScanSession,
    observer: &'a dyn ScanObserver,
    report: ScanReport,
}

impl<S: LibraryStore + ?Sized> Walker<'_, S> {
    fn scan_all(&mut self, roots: &[PathBuf]) -> Result<Flow, LibraryError> {
        for root in roots {
            if self.do_scan(root)? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }
        }
        Ok(Flow::Continue)
    }

    fn do_scan(&mut self, dir: &Path) -> Result<Flow, LibraryError> {
        if self.session.is_stopped() {
            return Ok(Flow::Stopped);
        }

        let key = path_key(dir);
        if self.rules.is_excluded(&key) {
            debug!("Excluded folder {}", key);
            return Ok(Flow::Continue);
        }
        self.observer.on_directory_changed(&key);

        // an unreadable folder keeps whatever the index holds for it
        let listing = match read_listing(dir, self.rules) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("Failed to list {}: {}", key, err);
                return Ok(Flow::Continue);
            }
        };

        let stored = self.store.stored_hash(&key)?;
        if listing.is_empty() {
            if stored.is_some() {
                debug!("Folder {} is empty now; dropping its songs", key);
                self.store.remove_songs_under_path(&key)?;
                self.store.remove_stored_hash(&key)?;
                self.report.directories_emptied += 1;
            }
            return Ok(Flow::Continue);
        }

        let (fingerprint, count) = compute_hash(&listing, self.rules);
        let hash = fingerprint.to_hex();
        if !self.options.force_rescan && stored.as_deref() == Some(hash.as_str()) {
            debug!("Skipping unchanged folder {}", key);
            self.report.directories_skipped += 1;
            let progress = self.session.advance(count as u64);
            self.observer.on_set_progress(progress.current, progress.total);
        } else if self.extract(dir, &key, &listing, &hash)? == Flow::Stopped {
            return Ok(Flow::Stopped);
        }
        self.observer.on_directory_scanned(&key);

        for entry in listing.entries().iter().filter(|entry| entry.is_dir) {
            if self.session.is_stopped() {
                return Ok(Flow::Stopped);
            }
            if self.do_scan(&dir.join(&entry.label))? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }
        }

        if self.session.is_stopped() {
            return Ok(Flow::Stopped);
        }
        Ok(Flow::Continue)
    }

    fn extract(
        &mut self,
        dir: &Path,
        key: &str,
        listing: &DirectoryListing,
        hash: &str,
    ) -> Result<Flow, LibraryError> {
        let mut existing: HashMap<String, SongRecord> = self.store.remove_songs_under_path(key)?;
        let mut batch = Vec::new();

        for entry in listing.entries() {
            if self.rules.kind(entry) != EntryKind::Audio {
                continue;
            }
            if self.session.is_stopped() {
                return Ok(Flow::Stopped);
            }
            let progress = self.session.advance(1);
            self.observer.on_set_progress(progress.current, progress.total);

            let path = dir.join(&entry.label);
            let info = match self.loader.try_load(&path) {
                Some(info) => info,
                None => {
                    debug!("Skipping {}: no readable tags", entry.path);
                    self.report.tags_missing += 1;
                    continue;
                }
            };

            let mut song = song_record(key, entry, info);
            if let Some(previous) = existing.remove(&song.path) {
                song.carry_over(&previous);
            }
            batch.push(song);
        }

        classify(
            &mut batch,
            &self.rules.artist_separator,
            &self.rules.various_artists_label,
        );

        for song in &batch {
            self.store.upsert_song(song)?;
        }
        self.store.set_stored_hash(key, hash)?;

        self.report.directories_scanned += 1;
        self.report.songs_added += batch.len();
        Ok(Flow::Continue)
    }
}

/// Entries directly inside `dir` that take part in change detection:
/// every visible sub-folder plus files of a known kind, minus excluded paths.
pub fn read_listing(dir: &Path, rules: &ScanRules) -> Result<DirectoryListing, walkdir::Error> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err),
            Err(err) => {
                debug!("Skipping unreadable entry in {:?}: {}", dir, err);
                continue;
            }
        };

        let label = entry.file_name().to_string_lossy().into_owned();
        if label.starts_with('.') {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!("Skipping {:?}: {}", entry.path(), err);
                continue;
            }
        };

        let is_dir = entry.file_type().is_dir();
        let file = FileEntry {
            path: path_key(entry.path()),
            label,
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata
                .modified()
                .map(FileTime::from_system_time)
                .unwrap_or_default(),
        };
        if !is_dir && rules.kind(&file) == EntryKind::Other {
            continue;
        }
        if rules.is_excluded(&file.path) {
            continue;
        }
        entries.push(file);
    }
    Ok(DirectoryListing::new(entries))
}

fn song_record(directory: &str, entry: &FileEntry, info: TagInfo) -> SongRecord {
    let title = info.title.unwrap_or_else(|| file_stem(&entry.label));
    SongRecord {
        id: stable_id(&entry.path),
        path: entry.path.clone(),
        directory: directory.to_string(),
        title,
        album: info.album.unwrap_or_default(),
        artist: info.artist.unwrap_or_default(),
        album_artist: info.album_artist.unwrap_or_default(),
        track: info.track_no.map(u32::from).unwrap_or(0),
        disc: info.disc_no.unwrap_or(0),
        year: info.year,
        duration_ms: info.duration_ms.unwrap_or(0),
        genres: info.genres,
        file_size: entry.size,
        modified: entry.modified,
        ..SongRecord::default()
    }
}

fn file_stem(label: &str) -> String {
    Path::new(label)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| label.to_string())
}

/// Counts audio files below `roots` for the progress total. Gives up quietly
/// once the scan is stopped or has already finished walking.
fn count_files(
    roots: &[PathBuf],
    rules: &ScanRules,
    session: &ScanSession,
    walking_done: &AtomicBool,
) {
    let mut total = 0u64;
    for root in roots {
        let entries = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || (!entry.file_name().to_string_lossy().starts_with('.')
                        && !rules.is_excluded(&path_key(entry.path())))
            })
            .filter_map(Result::ok);

        for entry in entries {
            if session.is_stopped() || walking_done.load(Ordering::Relaxed) {
                return;
            }
            if entry.file_type().is_file()
                && rules.is_audio_name(&entry.file_name().to_string_lossy())
            {
                total += 1;
            }
        }
    }
    debug!("Counted {} audio files", total);
    session.set_total(total);
}
