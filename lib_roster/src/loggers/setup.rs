//! Console + file logging on top of `fern`.
//!
//! Lines are formatted `[timestamp][target][LEVEL] message`. The console copy
//! gets a colored level; the file copy stays plain. Each run writes a new
//! timestamped file and prunes older ones.

use std::fs;
use std::path::{Path, PathBuf};

use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter};
use thiserror::Error;

/// Log files kept in `log_dir`, the new one included.
pub const KEEP_LOG_FILES: usize = 1;

const LOG_PREFIX: &str = "roster_";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Log directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A logger is already installed: {0}")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// Maps a level name to a filter. Unknown names fall back to `info`; `fatal`
/// maps to `error` since `log` has no such level.
pub fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "fatal" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn colored_level(level: Level) -> ColoredString {
    let label = level.to_string();
    match level {
        Level::Error => label.bright_red(),
        Level::Warn => label.bright_yellow(),
        Level::Info => label.bright_green(),
        Level::Debug => label.bright_white(),
        Level::Trace => label.bright_cyan(),
    }
}

/// Installs the global logger. Returns the path of this run's log file.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf, LoggingError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let log_path = log_dir.join(format!("{}{}.log", LOG_PREFIX, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")));
    let log_file = fern::log_file(&log_path)?;
    cleanup_old_logs(log_dir, KEEP_LOG_FILES)?;

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]").to_string().truecolor(128, 128, 128),
                record.target(),
                colored_level(record.level()),
                message
            ))
        })
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(log_file);

    fern::Dispatch::new()
        .level(parse_level(log_level))
        // The HTTP stack is chatty below warn.
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(console)
        .chain(file)
        .apply()?;

    Ok(log_path)
}

/// Deletes our `.log` files in `log_dir` except the `keep` most recent ones.
/// Returns how many were deleted.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<usize, LoggingError> {
    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let path = e.path();
            path.extension().is_some_and(|ext| ext == "log")
                && path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(LOG_PREFIX))
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((e.path(), modified))
        })
        .collect();

    // Newest first; the file name carries the timestamp and breaks ties.
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("fatal"), LevelFilter::Error);
        assert_eq!(parse_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_level("verbose"), LevelFilter::Info);
    }

    #[test]
    fn cleanup_keeps_newest_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["roster_2024-01-01_00-00-00.log", "roster_2024-01-02_00-00-00.log", "roster_2024-01-03_00-00-00.log"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::write(dir.path().join("other.log"), "x").unwrap();
        fs::write(dir.path().join("roster.conf"), "{}").unwrap();

        let removed = cleanup_old_logs(dir.path(), 1).unwrap();

        assert_eq!(removed, 2);
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&"other.log".to_string()));
        assert!(left.contains(&"roster.conf".to_string()));
        assert_eq!(left.iter().filter(|n| n.starts_with(LOG_PREFIX)).count(), 1);
    }

    #[test]
    fn cleanup_on_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cleanup_old_logs(&dir.path().join("nope"), 1).is_err());
    }
}
