//! Log file location and rotation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Maximum number of rolled log files to keep on disk.
pub const MAX_LOG_FILES: usize = 10;

/// File-name prefix of the rolling appender (`queue.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "queue";

/// Per-user data directory: `$XDG_DATA_HOME`, else `~/.local/share`
/// (`%LOCALAPPDATA%` on Windows).
pub fn data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("service-queue")
}

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir(), MAX_LOG_FILES);
}

fn is_log_file(name: &str) -> bool {
    name == LOG_FILE_PREFIX
        || name
            .strip_prefix(LOG_FILE_PREFIX)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn prune_logs_in(log_dir: &Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_log_file(name) {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so same-second files are stable.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "service-queue-{name}-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = get_log_dir();
        let d2 = get_log_dir();
        assert_eq!(d1, d2);
        assert!(d1.ends_with("service-queue/logs"));
    }

    #[test]
    fn test_log_file_name_matching() {
        assert!(is_log_file("queue"));
        assert!(is_log_file("queue.2026-03-02"));
        assert!(!is_log_file("queuex.2026-03-02"));
        assert!(!is_log_file("other.log"));
    }

    #[test]
    fn test_prune_keeps_newest_and_ignores_other_files() {
        let dir = scratch_dir("prune");
        for day in 1..=5 {
            fs::write(dir.join(format!("queue.2026-03-0{day}")), "x").unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        prune_logs_in(&dir, 2);

        let mut left: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&"notes.txt".to_string()));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        prune_logs_in(Path::new("/nonexistent/service-queue/logs"), 1);
    }
}
