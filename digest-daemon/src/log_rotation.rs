//! Size-based rotation of the daemon's log files.
//!
//! `digest.log` and `digest-err.log` roll over once they reach
//! [`MAX_LOG_BYTES`]; generations are numbered `.1` (newest) to
//! `.MAX_GENERATIONS` (oldest) and anything older is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use digest_core::paths::{stderr_log_path, stdout_log_path};

pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const MAX_GENERATIONS: usize = 5;

/// Roll `log_path` over when it holds at least `max_bytes`.
///
/// Returns whether a rotation happened. A missing log is not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, generations: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || generations == 0 {
        return Ok(false);
    }

    remove_if_present(&generation_path(log_path, generations))?;
    for n in (1..generations).rev() {
        let from = generation_path(log_path, n);
        if from.exists() {
            fs::rename(&from, generation_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, generation_path(log_path, 1))?;

    // Writers reopening by path must find a file.
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;
    Ok(true)
}

/// Rotate both daemon logs under `home`. Failures are logged, never raised.
pub fn rotate_logs(home: &Path) {
    for log_path in [stdout_log_path(home), stderr_log_path(home)] {
        match rotate_if_needed(&log_path, MAX_LOG_BYTES, MAX_GENERATIONS) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

fn generation_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("digest.log");
    base.with_file_name(format!("{name}.{n}"))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const SMALL_LIMIT: u64 = 1024;

    fn write_log(path: &Path, bytes: usize, fill: u8) {
        fs::write(path, vec![fill; bytes]).unwrap();
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("digest.log");
        write_log(&log, 100, b'a');

        assert!(!rotate_if_needed(&log, SMALL_LIMIT, MAX_GENERATIONS).unwrap());
        assert!(!generation_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_generation() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("digest.log");
        write_log(&log, SMALL_LIMIT as usize + 1, b'a');

        assert!(rotate_if_needed(&log, SMALL_LIMIT, MAX_GENERATIONS).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(
            fs::metadata(generation_path(&log, 1)).unwrap().len(),
            SMALL_LIMIT + 1
        );
    }

    #[test]
    fn oldest_generation_is_dropped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("digest.log");
        for n in 1..=MAX_GENERATIONS {
            fs::write(generation_path(&log, n), format!("gen-{n}")).unwrap();
        }
        write_log(&log, SMALL_LIMIT as usize, b'z');

        rotate_if_needed(&log, SMALL_LIMIT, MAX_GENERATIONS).unwrap();

        assert_eq!(
            fs::read_to_string(generation_path(&log, MAX_GENERATIONS)).unwrap(),
            format!("gen-{}", MAX_GENERATIONS - 1)
        );
        assert!(!generation_path(&log, MAX_GENERATIONS + 1).exists());
    }

    #[test]
    fn repeated_rotations_keep_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("digest.log");
        for round in 0..3u8 {
            write_log(&log, SMALL_LIMIT as usize, b'0' + round);
            rotate_if_needed(&log, SMALL_LIMIT, MAX_GENERATIONS).unwrap();
        }

        assert_eq!(fs::read(generation_path(&log, 1)).unwrap()[0], b'2');
        assert_eq!(fs::read(generation_path(&log, 3)).unwrap()[0], b'0');
        assert!(!generation_path(&log, 4).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("absent.log");
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, MAX_GENERATIONS).unwrap());
    }
}
