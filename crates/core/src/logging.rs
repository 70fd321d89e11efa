//! Log routing for the `cardiocam` process.
//!
//! Console and file filters are derived from [`LogSettings`], which is seeded
//! from the `[server]` table of `config.toml` and then overridden by the
//! command line and `RUST_LOG`. Daily log files live under
//! `<data_dir>/logs`; panics produce one JSON [`CrashReport`] each under
//! `<data_dir>/logs/crash`, carrying whatever model and request context the
//! process recorded with [`record_crash_context`] before it went down.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

use crate::config::ServerConfig;

pub const FALLBACK_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_PREFIX: &str = "cardiocam";
const LOG_FILE_SUFFIX: &str = "log";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_CONTEXT: Mutex<BTreeMap<String, String>> = Mutex::new(BTreeMap::new());
static REPORT_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to open rolling log file in {}: {source}", path.display())]
    Appender { path: PathBuf, source: InitError },
}

/// What the process was started to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Server,
    Predict,
    Inspect,
}

impl RunMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Predict => "predict",
            Self::Inspect => "inspect",
        }
    }
}

/// Where the effective user filter came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Flag,
    Verbosity,
    Environment,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub mode: RunMode,
    pub data_dir: PathBuf,
    pub retention_files: usize,
    pub noise_filter: String,
    pub file_noise_filter: String,
    pub verbose: u8,
    pub flag_filter: Option<String>,
    pub env_filter: Option<String>,
}

impl LogSettings {
    pub fn new(mode: RunMode, data_dir: &Path, server: &ServerConfig) -> Self {
        Self {
            mode,
            data_dir: data_dir.to_path_buf(),
            retention_files: server.log_retention_files.max(1),
            noise_filter: server.log_noise_filter.clone(),
            file_noise_filter: server.log_file_noise_filter.clone(),
            verbose: 0,
            flag_filter: None,
            env_filter: None,
        }
    }

    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_flag_filter(mut self, filter: Option<&str>) -> Self {
        self.flag_filter = filter.map(str::to_string);
        self
    }

    pub fn with_env_filter(mut self, filter: Option<String>) -> Self {
        self.env_filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn source(&self) -> FilterSource {
        if self.flag_filter.is_some() {
            FilterSource::Flag
        } else if self.verbose > 0 {
            FilterSource::Verbosity
        } else if self.env_filter.is_some() {
            FilterSource::Environment
        } else {
            FilterSource::Fallback
        }
    }

    pub fn user_filter(&self) -> String {
        match (self.source(), &self.flag_filter, &self.env_filter) {
            (FilterSource::Flag, Some(filter), _) => filter.clone(),
            (FilterSource::Verbosity, _, _) if self.verbose >= 2 => "trace".to_string(),
            (FilterSource::Verbosity, _, _) => "debug".to_string(),
            (FilterSource::Environment, _, Some(filter)) => filter.clone(),
            _ => FALLBACK_FILTER.to_string(),
        }
    }

    pub fn console_filter(&self) -> String {
        self.with_noise(&self.noise_filter)
    }

    pub fn file_filter(&self) -> String {
        self.with_noise(&self.file_noise_filter)
    }

    // An explicit choice on the command line is taken verbatim.
    fn with_noise(&self, noise: &str) -> String {
        let user = self.user_filter();
        let explicit = matches!(self.source(), FilterSource::Flag | FilterSource::Verbosity);
        if explicit || noise.trim().is_empty() {
            user
        } else {
            format!("{},{user}", noise.trim())
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_DIR_NAME)
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.log_dir().join(CRASH_DIR_NAME)
    }

    /// Daily `cardiocam.<date>.log` files, pruned to `retention_files`.
    pub fn open_file_sink(&self) -> Result<RollingFileAppender, LoggingError> {
        let log_dir = self.log_dir();
        fs::create_dir_all(&log_dir).map_err(|source| LoggingError::CreateDir {
            path: log_dir.clone(),
            source,
        })?;

        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(self.retention_files.max(1))
            .build(&log_dir)
            .map_err(|source| LoggingError::Appender {
                path: log_dir,
                source,
            })
    }
}

/// Attach a key/value pair to every crash report written from now on.
pub fn record_crash_context(key: &str, value: impl Into<String>) {
    CRASH_CONTEXT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.to_string(), value.into());
}

pub fn clear_crash_context(key: &str) {
    CRASH_CONTEXT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
}

pub fn crash_context() -> BTreeMap<String, String> {
    CRASH_CONTEXT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    /// A hook was already in place; reports keep going to this directory.
    AlreadyInstalled(PathBuf),
}

/// Install the process-wide panic hook once. Later calls leave the first
/// directory in place. The previous hook still runs after the report.
pub fn install_crash_hook(crash_dir: &Path) -> Result<CrashHook, LoggingError> {
    if let Some(existing) = CRASH_DIR.get() {
        return Ok(CrashHook::AlreadyInstalled(existing.clone()));
    }
    fs::create_dir_all(crash_dir).map_err(|source| LoggingError::CreateDir {
        path: crash_dir.to_path_buf(),
        source,
    })?;

    let mut installed = false;
    let active = CRASH_DIR.get_or_init(|| {
        installed = true;
        let target = crash_dir.to_path_buf();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            report_panic(&target, info);
            previous(info);
        }));
        crash_dir.to_path_buf()
    });

    if installed {
        Ok(CrashHook::Installed(active.clone()))
    } else {
        Ok(CrashHook::AlreadyInstalled(active.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub thread: String,
    pub location: Option<String>,
    pub message: String,
    /// `None` unless `RUST_BACKTRACE` enabled capture.
    pub backtrace: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl CrashReport {
    fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        Self {
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
            message: payload_message(info.payload()),
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
            context: crash_context(),
        }
    }

    /// Write as `panic-<timestamp>-<seq>.json` under `crash_dir`.
    pub fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:04}.json",
            self.timestamp.format("%Y%m%d-%H%M%S-%3f")
        ));
        let encoded = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, encoded)?;
        Ok(path)
    }
}

fn report_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside report writing must not recurse into the hook.
    if REPORT_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::from_panic(info).write_to(crash_dir)
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            crash_dir.display()
        ),
    }

    REPORT_IN_PROGRESS.store(false, Ordering::Release);
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
