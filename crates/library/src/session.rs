use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info};

/// State shared between a running scan, its file counter and whoever
/// started it. The counter only writes `total`; the walker only writes
/// `current`.
#[derive(Debug, Default)]
pub struct ScanSession {
    stop: AtomicBool,
    current: AtomicU64,
    total: AtomicU64,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            current: self.current.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn advance(&self, items: u64) -> ScanProgress {
        let current = self.current.fetch_add(items, Ordering::Relaxed) + items;
        ScanProgress {
            current,
            total: self.total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub current: u64,
    /// Zero until the file counter has finished.
    pub total: u64,
}

impl ScanProgress {
    pub fn percent(&self) -> Option<f32> {
        if self.total == 0 {
            None
        } else {
            Some((self.current as f32 / self.total as f32 * 100.0).min(100.0))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPhase {
    Scanning,
    Cleaning,
    Committing,
    RollingBack,
}

/// Callbacks made synchronously from the scanning thread.
pub trait ScanObserver: Send + Sync {
    fn on_state_changed(&self, _phase: ScanPhase) {}
    fn on_directory_changed(&self, _path: &str) {}
    fn on_directory_scanned(&self, _path: &str) {}
    fn on_set_progress(&self, _current: u64, _total: u64) {}
    fn on_finished(&self) {}
}

pub struct SilentObserver;

impl ScanObserver for SilentObserver {}

/// Reports scan progress through `tracing`.
#[derive(Debug, Default)]
pub struct LogObserver {
    last_percent: AtomicU64,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanObserver for LogObserver {
    fn on_state_changed(&self, phase: ScanPhase) {
        info!("Scan phase: {:?}", phase);
    }

    fn on_directory_changed(&self, path: &str) {
        debug!("Scanning {}", path);
    }

    fn on_set_progress(&self, current: u64, total: u64) {
        let progress = ScanProgress { current, total };
        let percent = match progress.percent() {
            Some(percent) => percent as u64,
            None => return,
        };
        // one line per ten percent
        let bucket = percent / 10;
        if self.last_percent.swap(bucket, Ordering::Relaxed) != bucket {
            info!("Scanned {} of {} files ({}%)", current, total, percent);
        }
    }

    fn on_finished(&self) {
        info!("Scan finished");
    }
}
