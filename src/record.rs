use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use tracing::{debug, warn};

use crate::Error;

pub const DEFAULT_MAX_LOG_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Where and how record sinks write, resolved from CLI flags and the
/// environment (`LOG_DIR_PATH`, `LOG_MAX_FILE_SIZE`, `LOG_FLUSH_TIME_INTERVAL`,
/// `LOG_RETENTION=archive`).
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub dir: PathBuf,
    pub max_size: u64,
    pub flush_interval: Duration,
    pub archive: bool,
}

impl SinkSettings {
    pub fn from_env(cli_dir: Option<PathBuf>, cli_archive: bool) -> Self {
        let dir = cli_dir
            .or_else(|| std::env::var_os("LOG_DIR_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("log"));
        let max_size = std::env::var("LOG_MAX_FILE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_LOG_SIZE);
        let flush_interval = std::env::var("LOG_FLUSH_TIME_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);
        let archive = cli_archive
            || std::env::var("LOG_RETENTION")
                .map(|v| v == "archive")
                .unwrap_or(false);

        SinkSettings {
            dir,
            max_size,
            flush_interval,
            archive,
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            dir: PathBuf::from("log"),
            max_size: DEFAULT_MAX_LOG_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            archive: false,
        }
    }
}

/// Append-only product record sink. One line per event, rotated at the size
/// cap and at day boundaries. The identity can be renamed mid-flight when a
/// connection announcement tells us who the peer is.
///
/// Recording is best effort: a sink failure is reported once through the
/// diagnostic log but never interrupts a transfer.
pub struct ProductLog {
    settings: SinkSettings,
    name: String,
    file: Option<File>,
    written: u64,
    day: u32,
    generation: u32,
    last_flush: Instant,
}

impl ProductLog {
    pub fn open(settings: SinkSettings, name: &str) -> Result<Self, Error> {
        fs::create_dir_all(&settings.dir)?;
        let mut log = ProductLog {
            settings,
            name: name.to_owned(),
            file: None,
            written: 0,
            day: Utc::now().ordinal(),
            generation: 1,
            last_flush: Instant::now(),
        };
        log.reopen()?;
        Ok(log)
    }

    /// A sink that forwards records to the diagnostic log only. Used in
    /// debug-foreground mode.
    pub fn disabled() -> Self {
        ProductLog {
            settings: SinkSettings::default(),
            name: String::new(),
            file: None,
            written: 0,
            day: 0,
            generation: 1,
            last_flush: Instant::now(),
        }
    }

    fn path(&self) -> PathBuf {
        self.settings.dir.join(format!("{}.log", self.name))
    }

    fn reopen(&mut self) -> Result<(), Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    /// Close, rename the sink file to carry `new_name`, and reopen. Later
    /// rotations keep the new identity.
    pub fn rename_identity(&mut self, new_name: &str) -> Result<(), Error> {
        if self.file.is_none() {
            self.name = new_name.to_owned();
            return Ok(());
        }

        self.file = None;
        let old = self.path();
        self.name = new_name.to_owned();
        let new = self.path();
        if old.exists() {
            fs::rename(&old, &new)?;
        }
        self.reopen()
    }

    /// Append one record: `<stamp> <TOKEN> <detail>`.
    pub fn record(&mut self, token: &str, detail: fmt::Arguments<'_>) {
        debug!("product {token} {detail}");

        if self.file.is_none() {
            return;
        }

        let now = Utc::now();
        let line = format!("{} {token} {detail}\n", now.format("%Y-%m-%dT%H:%M:%SZ"));

        if now.ordinal() != self.day || self.written + line.len() as u64 > self.settings.max_size {
            self.rotate();
            self.day = now.ordinal();
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("product sink write failed: {e}");
                self.file = None;
                return;
            }
            self.written += line.len() as u64;

            if self.last_flush.elapsed() >= self.settings.flush_interval {
                let _ = file.flush();
                self.last_flush = Instant::now();
            }
        }
    }

    fn rotate(&mut self) {
        self.file = None;

        let current = self.path();
        let aged = if self.settings.archive {
            let p = self
                .settings
                .dir
                .join(format!("{}.log.{}", self.name, self.generation));
            self.generation += 1;
            p
        } else {
            self.settings.dir.join(format!("{}.log.0", self.name))
        };

        if let Err(e) = fs::rename(&current, &aged) {
            warn!("product sink rotation failed: {e}");
        }
        if let Err(e) = self.reopen() {
            warn!("product sink reopen failed: {e}");
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}
