//! Download folder helpers.
//!
//! Files live under `<root>/<user id>/<name>`. A user folder is only touched
//! by cleanup when its owner has no job in flight, since an upload only reads
//! the file and does not refresh its modification time.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use crate::queue::UserId;

/// Largest upload a regular account may send.
pub const FREE_SIZE_LIMIT: u64 = 2_097_152_000;

/// Files in idle user folders older than this are removed.
pub const ORPHAN_STALE_AFTER: Duration = Duration::from_secs(45 * 60);

const SIZE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "mkv", "mov", "avi", "webm", "m4v", "3gp"];

/// Upload ceiling for the account type.
#[must_use]
pub const fn size_limit(is_premium: bool) -> u64 {
    if is_premium {
        2 * FREE_SIZE_LIMIT
    } else {
        FREE_SIZE_LIMIT
    }
}

/// Replaces characters that are unsafe in a file name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Whether the file name looks like a video, which is what custom
/// thumbnails apply to.
#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext)))
}

/// Path of a download for `user_id`, creating the user folder.
pub fn download_path(root: &Path, user_id: UserId, filename: &str) -> io::Result<PathBuf> {
    let folder = root.join(user_id.to_string());
    std::fs::create_dir_all(&folder)?;
    Ok(folder.join(sanitize_filename(filename)))
}

/// Removes a download, its partial siblings and the folder if now empty.
pub fn cleanup_download(path: &Path) {
    debug!("Cleaning download: {}", path.display());

    let mut candidates = vec![path.to_path_buf()];
    for suffix in [".temp", ".tmp"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        candidates.push(PathBuf::from(sibling));
    }

    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!("Cleanup failed for {}: {}", candidate.display(), e),
        }
    }

    if let Some(folder) = path.parent() {
        remove_if_empty(folder);
    }
}

/// Removes stale files from folders of users without an active job.
///
/// Returns `(files_removed, bytes_freed)`.
#[must_use]
pub fn cleanup_orphaned_files(
    root: &Path,
    active_users: &HashSet<UserId>,
    stale_after: Duration,
) -> (usize, u64) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return (0, 0),
        Err(e) => {
            warn!("Failed to list downloads folder {}: {}", root.display(), e);
            return (0, 0);
        }
    };

    let now = SystemTime::now();
    let mut files_removed = 0;
    let mut bytes_freed = 0;

    for entry in entries.flatten() {
        let folder = entry.path();
        if !folder.is_dir() {
            continue;
        }

        let owner = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<UserId>().ok());
        if owner.is_some_and(|id| active_users.contains(&id)) {
            debug!("Skipping folder of active user {}", folder.display());
            continue;
        }

        let (removed, freed) = remove_stale_files(&folder, now, stale_after);
        files_removed += removed;
        bytes_freed += freed;
        remove_if_empty(&folder);
    }

    if files_removed > 0 {
        warn!(
            "Orphan cleanup removed {} files, freed {}",
            files_removed,
            readable_size(bytes_freed)
        );
    }

    (files_removed, bytes_freed)
}

fn remove_stale_files(folder: &Path, now: SystemTime, stale_after: Duration) -> (usize, u64) {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return (0, 0);
    };

    let mut removed = 0;
    let mut freed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        if metadata.is_dir() {
            let (r, f) = remove_stale_files(&path, now, stale_after);
            removed += r;
            freed += f;
            remove_if_empty(&path);
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= stale_after {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(
                    "Removed stale file ({} min old): {}",
                    age.as_secs() / 60,
                    path.display()
                );
                removed += 1;
                freed += metadata.len();
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    (removed, freed)
}

fn remove_if_empty(folder: &Path) {
    let is_empty = std::fs::read_dir(folder).is_ok_and(|mut entries| entries.next().is_none());
    if is_empty {
        let _ = std::fs::remove_dir(folder);
    }
}

/// Formats a byte count as `12.34 MB`.
#[must_use]
pub fn readable_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in SIZE_UNITS {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    "File too large".to_owned()
}

/// Formats seconds as `1d2h3m4s`, omitting leading zero units.
#[must_use]
pub fn readable_time(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    for (value, unit) in [(days, 'd'), (hours, 'h'), (minutes, 'm')] {
        if value > 0 {
            out.push_str(&format!("{value}{unit}"));
        }
    }
    out.push_str(&format!("{seconds}s"));
    out
}
