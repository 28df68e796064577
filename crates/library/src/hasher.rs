use common::{DirectoryListing, PathFingerprint};

use crate::config::{EntryKind, ScanRules};

/// Fingerprints a directory listing from each entry's path, size and
/// modification time, and counts the audio files directly inside it.
///
/// The listing must already be in label order; the same entries in a
/// different order hash differently.
pub fn compute_hash(listing: &DirectoryListing, rules: &ScanRules) -> (PathFingerprint, usize) {
    let mut hasher = blake3::Hasher::new();
    let mut count = 0usize;
    for entry in listing.entries() {
        hasher.update(entry.path.as_bytes());
        hasher.update(&entry.size.to_le_bytes());
        hasher.update(&entry.modified.secs.to_le_bytes());
        hasher.update(&entry.modified.nanos.to_le_bytes());
        if rules.kind(entry) == EntryKind::Audio {
            count += 1;
        }
    }

    let mut digest = [0u8; 16];
    hasher.finalize_xof().fill(&mut digest);
    (PathFingerprint(digest), count)
}
