use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::{ColoredString, Colorize};

/// Installs the global logger: colored lines on stdout and plain lines in
/// `<log_dir>/<app_name>_<timestamp>.log`. Once the new file is in place,
/// older logs of the same app are removed. Returns the path of the new log
/// file.
pub fn setup_logging(log_dir: &Path, app_name: &str, log_level: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let log_file_name = format!(
        "{}_{}.log",
        app_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);
    let level = parse_level(log_level);

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                paint(record.level()),
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
        .level(level)
        // the HTTP stack is chatty below warn
        .level_for("hyper_util", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("tungstenite", log::LevelFilter::Warn)
        .chain(console)
        .chain(file)
        .apply()?;

    cleanup_old_logs(log_dir, app_name, &log_path)?;
    Ok(log_path)
}

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes every `<app_name>_*.log` in `log_dir` except `keep`. Returns how
/// many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: &Path) -> Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut removed = 0;
    for entry in fs::read_dir(log_dir)?.filter_map(|res| res.ok()) {
        let path = entry.path();
        let is_ours = path.extension().is_some_and(|ext| ext == "log")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix));
        if !is_ours || path == keep {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

fn paint(level: log::Level) -> ColoredString {
    let name = level.to_string();
    match level {
        log::Level::Error => name.red().bold(),
        log::Level::Warn => name.yellow(),
        log::Level::Info => name.green(),
        log::Level::Debug => name.blue(),
        log::Level::Trace => name.dimmed(),
    }
}
