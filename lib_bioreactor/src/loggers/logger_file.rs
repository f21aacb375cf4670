use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use glob::glob;
use log::{Level, LevelFilter};

/// Maps a configured level name to a filter. Unknown names mean `info`.
pub fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "fatal" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn colored_level(level: Level) -> colored::ColoredString {
    let text = level.to_string();
    match level {
        Level::Error => text.bright_red(),
        Level::Warn => text.bright_yellow(),
        Level::Info => text.bright_green(),
        Level::Debug => text.bright_white(),
        Level::Trace => text.bright_cyan(),
    }
}

/// Installs the global logger: coloured lines on stdout and plain lines in a
/// fresh timestamped file `<app_name>_<YYYY-mm-dd_HH-MM-SS>.log` under
/// `log_dir`. Older files of the same app are rotated so that only the most
/// recent previous run survives next to the new one.
///
/// Returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<PathBuf, fern::InitError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    rotate_logs(app_name, log_dir, 1);

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}{}[{}] {}",
                chrono::Local::now()
                    .format("[%Y-%m-%d %H:%M:%S]")
                    .to_string()
                    .truecolor(128, 128, 128),
                format!("[{}]", record.target()).truecolor(128, 128, 128),
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
        .chain(fern::log_file(&log_path)?);

    fern::Dispatch::new()
        .level(parse_level(log_level))
        // sqlx logs every statement at info
        .level_for("sqlx", LevelFilter::Warn)
        .chain(console)
        .chain(file)
        .apply()?;

    Ok(log_path)
}

/// Deletes all but the newest `keep` log files of `app_name` in `log_dir`.
///
/// File names carry a sortable timestamp, so the newest files sort last.
/// Returns the number of files removed.
pub fn rotate_logs(app_name: &str, log_dir: &Path, keep: usize) -> usize {
    let pattern = format!("{}/{}_*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return 0;
        }
    };

    // Newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_newest_files_of_the_app_only() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "server_bioreactor_2024-05-01_10-00-00.log",
            "server_bioreactor_2024-05-02_10-00-00.log",
            "server_bioreactor_2024-05-03_10-00-00.log",
            "other_app_2024-05-01_10-00-00.log",
        ];
        for name in names {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let removed = rotate_logs("server_bioreactor", dir.path(), 1);
        assert_eq!(removed, 2);
        assert!(dir.path().join("server_bioreactor_2024-05-03_10-00-00.log").exists());
        assert!(!dir.path().join("server_bioreactor_2024-05-01_10-00-00.log").exists());
        assert!(dir.path().join("other_app_2024-05-01_10-00-00.log").exists());
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("verbose"), LevelFilter::Info);
        assert_eq!(parse_level("fatal"), LevelFilter::Error);
    }
}
