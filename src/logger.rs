//! Log sink selection (§10.3): stderr via `simple_logger`, a file via a small
//! `log::Log` impl of our own (`simple_logger` has no file sink), or a
//! warn-and-fall-back-to-stderr for the unimplemented syslog destination.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::{LogDestination, LogLevel};

struct FileLogger {
    level: Level,
    file: Mutex<std::fs::File>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(file, "[{}] - ({}) - {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        let _ = self.file.lock().unwrap_or_else(|e| e.into_inner()).flush();
    }
}

/// Initializes the global logger per the configured destination. `foreground`
/// (`-f`) always forces stderr regardless of `LogDestination` (§10.2).
pub fn init(level: LogLevel, destination: &LogDestination, foreground: bool) -> Result<()> {
    let log_level = level.as_level();

    if foreground {
        simple_logger::init_with_level(log_level)?;
        return Ok(());
    }

    match destination {
        LogDestination::Stderr => {
            simple_logger::init_with_level(log_level)?;
        }
        LogDestination::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let logger = FileLogger { level: log_level, file: Mutex::new(file) };
            log::set_boxed_logger(Box::new(logger))?;
            log::set_max_level(LevelFilter::from(log_level));
        }
        LogDestination::Syslog { facility } => {
            simple_logger::init_with_level(log_level)?;
            log::warn!("LogDestination x-syslog:///{facility} is not implemented in this build; logging to stderr");
        }
    }

    Ok(())
}
