//! Best-effort on-disk ring cache.
//!
//! The cache lets a restarted client resolve replicas before the control
//! plane answers. It is never authoritative and never fails the caller:
//! problems are logged at debug and swallowed. Updates go through a sibling
//! temp file and an atomic rename, so the cached ring is always either the
//! old encoding or the new one, never a partial write.

use std::fs::File;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use super::Ring;

/// Loads the cached ring, if one is present and decodes cleanly.
pub(crate) fn load(path: &Path) -> Option<Ring> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %path.display(), %err, "no cached ring loaded");
            return None;
        }
    };
    match Ring::load(file) {
        Ok(ring) => Some(ring),
        Err(err) => {
            debug!(path = %path.display(), %err, "cached ring rejected");
            None
        }
    }
}

/// Replaces the cached ring atomically. Best-effort: failures are logged at
/// debug and the previous cache contents are left intact.
pub(crate) fn store(path: &Path, ring: &Ring) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(err) = std::fs::create_dir_all(dir) {
        debug!(path = %path.display(), %err, "ring cache directory not created");
        return;
    }
    // The temp file must live in the target directory for the rename to be
    // atomic. NamedTempFile removes it on drop if persist never happens.
    let tmp = match NamedTempFile::new_in(dir) {
        Ok(tmp) => tmp,
        Err(err) => {
            debug!(path = %path.display(), %err, "ring cache temp file not created");
            return;
        }
    };
    if let Err(err) = ring.persist(tmp.as_file()) {
        debug!(path = %path.display(), %err, "ring not cached");
        return;
    }
    if let Err(err) = tmp.persist(path) {
        debug!(path = %path.display(), err = %err.error, "ring cache rename failed");
    }
}
