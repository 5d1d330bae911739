//! Output naming and on-disk segment bookkeeping.
//!
//! Segments of a playlist `<dir>/<base>.m3u8` are named
//! `<dir>/<base><index><extension>`; the fMP4 init segment is index `-1`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha1::{Digest, Sha1};
use tokio::fs;
use tracing::{debug, warn};

/// Deterministic output path for a transcode identified by `key_parts`.
pub fn output_path_for(transcode_dir: &Path, key_parts: &[&str], extension: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    for (i, part) in key_parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    let name = hex::encode(hasher.finalize());
    transcode_dir.join(format!("{name}{extension}"))
}

fn base_name(playlist_path: &Path) -> String {
    playlist_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn directory(playlist_path: &Path) -> &Path {
    playlist_path.parent().unwrap_or_else(|| Path::new("."))
}

pub fn segment_path(playlist_path: &Path, index: i64, extension: &str) -> PathBuf {
    directory(playlist_path).join(format!("{}{index}{extension}", base_name(playlist_path)))
}

/// Index encoded in a segment file name belonging to `playlist_path`.
pub fn index_from_segment_file(playlist_path: &Path, segment_file: &Path) -> Option<i64> {
    let base = base_name(playlist_path);
    let stem = segment_file.file_stem()?.to_str()?;
    stem.strip_prefix(base.as_str())?.parse().ok()
}

/// Index of the most recently written media segment of `playlist_path`.
pub async fn newest_segment_index(playlist_path: &Path, extension: &str) -> Option<i64> {
    let mut newest: Option<(SystemTime, i64)> = None;
    for (path, modified) in segment_files(playlist_path, extension).await {
        let Some(index) = index_from_segment_file(playlist_path, &path) else {
            continue;
        };
        if index < 0 {
            continue;
        }
        let is_newer = match newest {
            None => true,
            Some((time, current)) => modified > time || (modified == time && index > current),
        };
        if is_newer {
            newest = Some((modified, index));
        }
    }
    newest.map(|(_, index)| index)
}

async fn segment_files(playlist_path: &Path, extension: &str) -> Vec<(PathBuf, SystemTime)> {
    let base = base_name(playlist_path);
    let mut files = Vec::new();
    let Ok(mut entries) = fs::read_dir(directory(playlist_path)).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(base.as_str()) || !name.ends_with(extension) {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => SystemTime::UNIX_EPOCH,
        };
        files.push((entry.path(), modified));
    }
    files
}

/// Deletes segments with an index in `first..=last`. Returns how many were removed.
///
/// Individual failures are logged and skipped.
pub async fn delete_segments_in_range(
    playlist_path: &Path,
    extension: &str,
    first: i64,
    last: i64,
) -> usize {
    let mut deleted = 0;
    for (path, _) in segment_files(playlist_path, extension).await {
        let Some(index) = index_from_segment_file(playlist_path, &path) else {
            continue;
        };
        if index < first || index > last {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete segment {}: {}", path.display(), e),
        }
    }
    if deleted > 0 {
        debug!(
            "Deleted {} segments [{}..={}] of {}",
            deleted,
            first,
            last,
            playlist_path.display()
        );
    }
    deleted
}

/// Clears what an earlier run left from segment `first` on, so a restarted
/// transcode is never judged by another run's files. Removes the playlist too.
///
/// Returns the number of deleted segments.
pub async fn delete_stale_run(playlist_path: &Path, extension: &str, first: i64) -> usize {
    let deleted = delete_segments_in_range(playlist_path, extension, first, i64::MAX).await;
    match fs::remove_file(playlist_path).await {
        Ok(()) => debug!("Deleted stale playlist {}", playlist_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete playlist {}: {}", playlist_path.display(), e),
    }
    deleted
}

/// Deletes every file sharing the output's base name: playlist, segments, init segment and log.
pub async fn delete_partial_stream_files(output_path: &Path) -> usize {
    let base = base_name(output_path);
    if base.is_empty() {
        return 0;
    }
    let Ok(mut entries) = fs::read_dir(directory(output_path)).await else {
        return 0;
    };

    let mut deleted = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(base.as_str()) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
    debug!("Deleted {} files for {}", deleted, output_path.display());
    deleted
}

/// Whether the playlist written by the transcoder already lists `segment_file`.
///
/// A listed segment is complete on disk.
pub async fn playlist_references_segment(playlist_path: &Path, segment_file: &Path) -> bool {
    let Some(name) = segment_file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return false;
    };
    match fs::read_to_string(playlist_path).await {
        Ok(contents) => contents.lines().any(|line| {
            let line = line.trim();
            !line.starts_with('#')
                && Path::new(line).file_name().is_some_and(|f| f.to_string_lossy() == name)
        }),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_output_path_is_deterministic() {
        let dir = Path::new("/transcodes");
        let a = output_path_for(dir, &["dev", "session", "src", "ts"], ".m3u8");
        let b = output_path_for(dir, &["dev", "session", "src", "ts"], ".m3u8");
        let c = output_path_for(dir, &["dev", "other", "src", "ts"], ".m3u8");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.extension().unwrap(), "m3u8");
        assert_eq!(a.file_stem().unwrap().len(), 40);
    }

    #[test]
    fn test_segment_naming() {
        let playlist = Path::new("/t/abc.m3u8");
        assert_eq!(segment_path(playlist, 12, ".ts"), PathBuf::from("/t/abc12.ts"));
        assert_eq!(index_from_segment_file(playlist, Path::new("/t/abc12.ts")), Some(12));
        assert_eq!(index_from_segment_file(playlist, Path::new("/t/abc-1.mp4")), Some(-1));
        assert_eq!(index_from_segment_file(playlist, Path::new("/t/other3.ts")), None);
    }

    #[tokio::test]
    async fn test_newest_segment_by_mtime() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        std::fs::write(segment_path(&playlist, 5, ".ts"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(segment_path(&playlist, 2, ".ts"), b"x").unwrap();
        std::fs::write(dir.path().join("zzz9.ts"), b"x").unwrap();

        assert_eq!(newest_segment_index(&playlist, ".ts").await, Some(2));
        assert_eq!(newest_segment_index(&playlist, ".mp4").await, None);
    }

    #[tokio::test]
    async fn test_delete_range_keeps_later_segments() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        for i in 0..10 {
            std::fs::write(segment_path(&playlist, i, ".ts"), b"x").unwrap();
        }

        assert_eq!(delete_segments_in_range(&playlist, ".ts", 0, 7).await, 8);
        assert!(!segment_path(&playlist, 7, ".ts").exists());
        assert!(segment_path(&playlist, 8, ".ts").exists());
        assert!(segment_path(&playlist, 9, ".ts").exists());
    }

    #[tokio::test]
    async fn test_delete_stale_run_from_restart_index() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        std::fs::write(&playlist, "#EXTM3U\nabc4.ts\n").unwrap();
        for i in 2..6 {
            std::fs::write(segment_path(&playlist, i, ".ts"), b"x").unwrap();
        }

        assert_eq!(delete_stale_run(&playlist, ".ts", 4).await, 2);
        assert!(segment_path(&playlist, 3, ".ts").exists());
        assert!(!segment_path(&playlist, 4, ".ts").exists());
        assert!(!segment_path(&playlist, 5, ".ts").exists());
        assert!(!playlist.exists());

        // Nothing left to delete is fine
        assert_eq!(delete_stale_run(&playlist, ".ts", 4).await, 0);
    }

    #[tokio::test]
    async fn test_delete_partial_stream_files() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        std::fs::write(&playlist, b"#EXTM3U").unwrap();
        std::fs::write(segment_path(&playlist, 0, ".mp4"), b"x").unwrap();
        std::fs::write(segment_path(&playlist, -1, ".mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("abc.m3u8.log"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.ts"), b"x").unwrap();

        assert_eq!(delete_partial_stream_files(&playlist).await, 4);
        assert!(dir.path().join("keep.ts").exists());
    }

    #[tokio::test]
    async fn test_playlist_reference_check() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        std::fs::write(&playlist, "#EXTM3U\n#EXTINF:6.0,\nabc0.ts\n").unwrap();

        assert!(playlist_references_segment(&playlist, &dir.path().join("abc0.ts")).await);
        assert!(!playlist_references_segment(&playlist, &dir.path().join("abc1.ts")).await);
    }
}
