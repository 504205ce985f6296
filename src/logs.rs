// src/logs.rs
//
// =============================================================================
// RELAXRUN: RUN LOGGER
// =============================================================================
//
// A `log::Log` implementation with two outputs:
// - stdout at the user-chosen verbosity (0..3 => ERROR/WARN/INFO/DEBUG);
// - one DEBUG-level file per registered seed under `logs/<seed>.log`.
//
// Workers tag their records with the seed as the log target; the logger
// routes tagged records to the matching file sink. Registration follows the
// claim: a worker registers a seed when it wins the lock and unregisters on
// release.

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared registry of per-seed file sinks. Cloneable handle; the leaked
/// global logger and the worker loops share the same map.
#[derive(Clone, Default)]
pub struct SeedSinks {
    inner: Arc<Mutex<HashMap<String, fs::File>>>,
}

impl SeedSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `logs/<seed>.log` for append under `root` and start routing.
    pub fn register(&self, seed: &str, root: &Path) -> std::io::Result<()> {
        let log_dir = root.join("logs");
        fs::create_dir_all(&log_dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(format!("{seed}.log")))?;
        self.inner.lock().unwrap().insert(seed.to_string(), file);
        Ok(())
    }

    pub fn unregister(&self, seed: &str) {
        self.inner.lock().unwrap().remove(seed);
    }

    fn write_line(&self, target: &str, line: &str) {
        if let Some(file) = self.inner.lock().unwrap().get_mut(target) {
            let _ = writeln!(file, "{line}");
        }
    }
}

pub struct RunLogger {
    stdout_level: Level,
    sinks: SeedSinks,
}

impl RunLogger {
    pub fn stdout_level_for(verbosity: u8) -> Level {
        match verbosity {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            _ => Level::Debug,
        }
    }

    pub fn new(verbosity: u8, sinks: SeedSinks) -> Self {
        Self {
            stdout_level: Self::stdout_level_for(verbosity),
            sinks,
        }
    }

    /// Install as the global logger. The max level stays at DEBUG so the
    /// per-seed files always get the full story regardless of verbosity.
    pub fn init(verbosity: u8) -> Result<SeedSinks, SetLoggerError> {
        let sinks = SeedSinks::new();
        let logger = Box::new(RunLogger::new(verbosity, sinks.clone()));
        log::set_logger(Box::leak(logger)).map(|()| log::set_max_level(LevelFilter::Debug))?;
        Ok(sinks)
    }

    fn format_line(record: &Record) -> String {
        format!(
            "{} - {} | {:>8}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.target(),
            record.level(),
            record.args()
        )
    }
}

impl Log for RunLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = Self::format_line(record);
        if record.level() <= self.stdout_level {
            println!("{line}");
        }
        self.sinks.write_line(record.target(), &line);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(args: std::fmt::Arguments<'a>, target: &'a str, level: Level) -> Record<'a> {
        Record::builder()
            .args(args)
            .target(target)
            .level(level)
            .build()
    }

    #[test]
    fn registered_seed_receives_debug_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = SeedSinks::new();
        sinks.register("seed", dir.path()).unwrap();

        let logger = RunLogger::new(0, sinks.clone());
        logger.log(&record(
            format_args!("polling process"),
            "seed",
            Level::Debug,
        ));
        logger.log(&record(
            format_args!("other seed noise"),
            "elsewhere",
            Level::Debug,
        ));
        sinks.unregister("seed");

        let contents = fs::read_to_string(dir.path().join("logs/seed.log")).unwrap();
        assert!(contents.contains("polling process"));
        assert!(!contents.contains("other seed noise"));
    }

    #[test]
    fn unregistered_seed_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = SeedSinks::new();
        sinks.register("seed", dir.path()).unwrap();
        sinks.unregister("seed");

        let logger = RunLogger::new(3, sinks);
        logger.log(&record(format_args!("late message"), "seed", Level::Info));

        let contents = fs::read_to_string(dir.path().join("logs/seed.log")).unwrap();
        assert!(!contents.contains("late message"));
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(RunLogger::stdout_level_for(0), Level::Error);
        assert_eq!(RunLogger::stdout_level_for(1), Level::Warn);
        assert_eq!(RunLogger::stdout_level_for(2), Level::Info);
        assert_eq!(RunLogger::stdout_level_for(3), Level::Debug);
        assert_eq!(RunLogger::stdout_level_for(9), Level::Debug);
    }
}
