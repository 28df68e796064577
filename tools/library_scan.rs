use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::{config_path_from_env, resolve_path, Library, LogObserver, ScanOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut options = ScanOptions::default();
    let mut paths = Vec::new();
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--rescan" => options.force_rescan = true,
            "-h" | "--help" => {
                println!("usage: library_scan [--rescan] [PATH...]");
                return Ok(());
            }
            flag if flag.starts_with("--") => {
                return Err(format!("unknown option {}", flag).into());
            }
            _ => paths.push(PathBuf::from(arg)),
        }
    }

    let config_path = config_path_from_env();
    let (library, config) = Library::from_config_path(&config_path)?;
    if paths.is_empty() {
        paths = config
            .scan_paths
            .iter()
            .map(|path| resolve_path(&config_path, path))
            .collect();
    }

    let handle = library.start_scan(paths, options, Arc::new(LogObserver::new()))?;
    let report = handle.wait()?;
    let stats = library.stats()?;

    if report.cancelled {
        println!("Scan cancelled; library unchanged");
    }
    println!(
        "Scanned {} folders ({} unchanged), {} songs read, {} without tags, {} orphans removed",
        report.directories_scanned,
        report.directories_skipped,
        report.songs_added,
        report.tags_missing,
        report.orphans_removed
    );
    println!(
        "Indexed: {} songs in {} folders",
        stats.songs, stats.directories
    );

    Ok(())
}
