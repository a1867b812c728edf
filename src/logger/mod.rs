//! Named loggers used by every SDK subsystem.
//!
//! Each subsystem owns a `static LOGGER: LazyLock<Logger>` (for example
//! `@kinvey/datastore`). The process-wide level starts from the
//! `KINVEY_LOG_LEVEL` environment variable (`info` when unset or invalid) and can be
//! changed with [`set_log_level`]; a single logger can override it. Records reach
//! stdout/stderr unless [`set_log_handler`] replaces the output, and
//! [`set_user_log_handler`] additionally forwards them to an application sink.

use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

/// Environment variable read once to seed the global level.
pub const LOG_LEVEL_ENV: &str = "KINVEY_LOG_LEVEL";

const UNSET: u8 = u8::MAX;

static GLOBAL_LOG_LEVEL: LazyLock<AtomicU8> = LazyLock::new(|| {
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| value.parse::<LogLevel>().ok())
        .unwrap_or(LogLevel::Info);
    AtomicU8::new(level as u8)
});

static OUTPUT: LazyLock<RwLock<Option<LogCallback>>> = LazyLock::new(|| RwLock::new(None));
static USER_SINK: LazyLock<RwLock<Option<UserSink>>> = LazyLock::new(|| RwLock::new(None));

/// Callback signature accepted by [`set_log_handler`] and [`set_user_log_handler`].
pub type LogCallback = Arc<dyn Fn(&LogRecord) + Send + Sync + 'static>;

#[derive(Clone)]
struct UserSink {
    callback: LogCallback,
    min_level: Option<LogLevel>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Silent = 4,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" | "verbose" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "silent" | "off" | "none" => Ok(LogLevel::Silent),
            other => Err(LogError::InvalidLogLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogError {
    InvalidLogLevel(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::InvalidLogLevel(level) => write!(f, "Invalid log level \"{level}\""),
        }
    }
}

impl std::error::Error for LogError {}

/// One emitted log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub logger_name: String,
    pub message: String,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    level_override: AtomicU8,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                name: name.into(),
                level_override: AtomicU8::new(UNSET),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Effective level: the override when set, otherwise the global level.
    pub fn log_level(&self) -> LogLevel {
        match self.inner.level_override.load(Ordering::SeqCst) {
            UNSET => global_log_level(),
            raw => LogLevel::from_raw(raw),
        }
    }

    /// Pins this logger's level; `None` follows the global level again.
    pub fn set_log_level(&self, level: Option<LogLevel>) {
        let raw = level.map_or(UNSET, |level| level as u8);
        self.inner.level_override.store(raw, Ordering::SeqCst);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if level == LogLevel::Silent {
            return;
        }
        let user_sink = read(&USER_SINK);
        let own_level = self.log_level();
        let reaches_user = user_sink
            .as_ref()
            .is_some_and(|sink| level >= sink.min_level.unwrap_or(own_level));
        let reaches_output = level >= own_level;
        if !reaches_user && !reaches_output {
            return;
        }

        let record = LogRecord {
            level,
            logger_name: self.inner.name.clone(),
            message: message.to_owned(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        if let (true, Some(sink)) = (reaches_user, user_sink) {
            (sink.callback)(&record);
        }
        if reaches_output {
            match read(&OUTPUT) {
                Some(output) => output(&record),
                None => write_console(&record),
            }
        }
    }
}

fn read<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(slot: &RwLock<Option<T>>, value: Option<T>) {
    *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

fn write_console(record: &LogRecord) {
    let LogRecord {
        level,
        logger_name,
        message,
        timestamp,
    } = record;
    match level {
        LogLevel::Warn | LogLevel::Error => eprintln!("[{timestamp}] {level} {logger_name}: {message}"),
        _ => println!("[{timestamp}] {level} {logger_name}: {message}"),
    }
}

pub fn global_log_level() -> LogLevel {
    LogLevel::from_raw(GLOBAL_LOG_LEVEL.load(Ordering::SeqCst))
}

/// Sets the level used by every logger without an override.
pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Parses `level` (`debug`, `info`, `warn`, `error`, `silent`) and applies it globally.
pub fn set_log_level_str(level: &str) -> Result<(), LogError> {
    set_log_level(level.parse()?);
    Ok(())
}

/// Replaces console output for records that pass their logger's level. `None`
/// restores console output.
pub fn set_log_handler(handler: Option<LogCallback>) {
    write(&OUTPUT, handler);
}

/// Forwards records to `callback` in addition to the regular output. With
/// `min_level` unset, each logger's effective level applies.
pub fn set_user_log_handler(callback: Option<LogCallback>, min_level: Option<LogLevel>) {
    write(
        &USER_SINK,
        callback.map(|callback| UserSink { callback, min_level }),
    );
}
