use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Size and freshness of a folder tree, the inputs of a derived version key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStats {
    /// Sum of regular file sizes.
    pub total_bytes: u64,
    pub file_count: u64,
    /// Newest modification time across the folder and everything in it.
    pub modified_at_millis: i64,
}

/// Walk `root` without following symlinks.
///
/// Entries that vanish mid-walk are skipped; any other IO error aborts.
pub fn measure_folder(root: &Path) -> io::Result<FolderStats> {
    let root_meta = std::fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut stats = FolderStats {
        total_bytes: 0,
        file_count: 0,
        modified_at_millis: mtime_millis(&root_meta),
    };

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err.into()),
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err.into()),
        };
        stats.modified_at_millis = stats.modified_at_millis.max(mtime_millis(&meta));
        if meta.is_file() {
            stats.total_bytes = stats.total_bytes.saturating_add(meta.len());
            stats.file_count += 1;
        }
    }

    Ok(stats)
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
