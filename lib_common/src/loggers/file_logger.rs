use anyhow::Result;
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

/// Maps a level name to a filter; anything unrecognised is `Info`.
pub fn parse_level(name: &str) -> log::LevelFilter {
    match name.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger: `[date][target][LEVEL] message` to stdout and
/// to `<log_dir>/<prefix>_<YYYY-mm-dd_HH-MM-SS>.log`. Earlier logs of the same
/// `prefix` are pruned first, keeping the newest one.
///
/// Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str, prefix: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir, prefix, 1)?;

    let log_file_name = format!("{}_{}.log", prefix, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        // Request-level chatter from the HTTP stack.
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes `<prefix>_*.log` files in `log_dir` except the `keep` newest.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    let stem = format!("{}_", prefix);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&stem))
        .collect();

    // Newest first; unreadable timestamps sort last.
    entries.sort_by_key(|e| Reverse(e.metadata().and_then(|m| m.modified()).ok()));

    let mut removed = 0;
    for entry in entries.iter().skip(keep) {
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warn"), log::LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Error);
        assert_eq!(parse_level("chatty"), log::LevelFilter::Info);
    }

    #[test]
    fn keeps_only_the_newest_logs_of_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();

        for (i, name) in ["reader_a.log", "reader_b.log", "reader_c.log"].iter().enumerate() {
            let path = dir.path().join(name);
            fs::write(&path, "x").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(now - Duration::from_secs(100 - i as u64 * 10)).unwrap();
        }
        fs::write(dir.path().join("server_a.log"), "x").unwrap();
        fs::write(dir.path().join("reader_notes.txt"), "x").unwrap();

        let removed = cleanup_old_logs(dir.path(), "reader", 1).unwrap();

        assert_eq!(removed, 2);
        assert!(dir.path().join("reader_c.log").exists());
        assert!(!dir.path().join("reader_a.log").exists());
        assert!(dir.path().join("server_a.log").exists());
        assert!(dir.path().join("reader_notes.txt").exists());
    }
}
