// Plugin Sandbox - Systemd-Style Logger
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Systemd-style logging implementation compatible with journald
//!
//! This logger provides structured logging that follows systemd/journald conventions:
//! - Log levels: err, warning, notice, info, debug
//! - Clean, readable output for both terminal and journald
//! - A per-thread capture hook so a caller can collect the records emitted
//!   while one plugin is loading

use std::cell::RefCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log levels following systemd priority conventions
/// https://www.freedesktop.org/software/systemd/man/sd-daemon.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Error conditions (3)
    Error = 3,
    /// Warning conditions (4)
    Warning = 4,
    /// Normal but significant condition (5)
    Notice = 5,
    /// Informational message (6)
    Info = 6,
    /// Debug-level message (7)
    Debug = 7,
}

impl LogLevel {
    /// Get the priority number for systemd
    pub fn priority(self) -> u8 {
        self as u8
    }

    /// Get the string representation
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Get color code for terminal output
    pub fn color_code(self) -> &'static str {
        match self {
            LogLevel::Error => "\x1b[31m",   // Red
            LogLevel::Warning => "\x1b[33m", // Yellow
            LogLevel::Notice => "\x1b[36m",  // Cyan
            LogLevel::Info => "\x1b[32m",    // Green
            LogLevel::Debug => "\x1b[37m",   // White/gray
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub min_level: LogLevel,
    /// Whether to use colors in output
    pub use_colors: bool,
    /// Whether to include timestamps
    pub include_timestamp: bool,
    /// Whether to format for journald (structured format)
    pub journald_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            use_colors: atty::is(atty::Stream::Stderr),
            include_timestamp: true,
            journald_format: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("logger lock poisoned during initialization")]
    InitError,
    #[error("logger already initialized")]
    AlreadyInitialized,
}

/// A record collected by [`capture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

thread_local! {
    static CAPTURE: RefCell<Option<Vec<CapturedRecord>>> = const { RefCell::new(None) };
}

/// Systemd-style logger implementation
#[derive(Debug)]
pub struct Logger {
    config: LoggerConfig,
    min_level: AtomicU8,
}

impl Logger {
    /// Create a new logger with the given configuration
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            min_level: AtomicU8::new(config.min_level.priority()),
            config,
        }
    }

    /// Initialize the global logger
    pub fn init(config: LoggerConfig) -> Result<(), LoggerError> {
        let logger = Self::new(config);

        let mut global_logger = LOGGER.lock().map_err(|_| LoggerError::InitError)?;
        if global_logger.is_some() {
            return Err(LoggerError::AlreadyInitialized);
        }
        *global_logger = Some(logger);

        Ok(())
    }

    /// Set the minimum log level at runtime
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level.priority(), Ordering::Relaxed);
    }

    /// Check if a log level should be output
    pub fn should_log(&self, level: LogLevel) -> bool {
        level.priority() <= self.min_level.load(Ordering::Relaxed)
    }

    /// Log a message with the given level
    pub fn log(&self, level: LogLevel, target: &str, message: &str) {
        if !self.should_log(level) {
            return;
        }

        let timestamp = if self.config.include_timestamp {
            Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            )
        } else {
            None
        };

        let formatted = if self.config.journald_format {
            self.format_journald(level, target, message, timestamp)
        } else {
            self.format_terminal(level, message, timestamp)
        };

        eprintln!("{}", formatted);
    }

    /// Format for journald structured output
    fn format_journald(
        &self,
        level: LogLevel,
        target: &str,
        message: &str,
        timestamp: Option<u64>,
    ) -> String {
        let mut output = String::new();

        output.push_str(&format!("PRIORITY={}\n", level.priority()));
        output.push_str(&format!("MESSAGE={}\n", message));

        if !target.is_empty() {
            output.push_str(&format!("CODE_FILE={}\n", target));
        }

        if let Some(ts) = timestamp {
            // microseconds
            output.push_str(&format!("_SOURCE_REALTIME_TIMESTAMP={}\n", ts * 1_000_000));
        }

        output.push_str("SYSLOG_IDENTIFIER=plugin-sandbox\n");

        output
    }

    /// Format for terminal output
    fn format_terminal(&self, level: LogLevel, message: &str, timestamp: Option<u64>) -> String {
        let mut output = String::new();

        if let Some(ts) = timestamp {
            let datetime = chrono::DateTime::from_timestamp(ts as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            output.push_str(&format!("{} ", datetime));
        }

        // Systemd-style status lines carry their own marker, only color them
        let status_line = message.starts_with("[*]")
            || message.starts_with("[   OK   ]")
            || message.starts_with("[  FAILED ]");

        match (status_line, self.config.use_colors) {
            (true, true) => {
                output.push_str(&format!("{}{}\x1b[0m", level.color_code(), message));
            }
            (true, false) => output.push_str(message),
            (false, true) => {
                output.push_str(&format!(
                    "{}[{}]\x1b[0m {}",
                    level.color_code(),
                    level.as_str(),
                    message
                ));
            }
            (false, false) => output.push_str(&format!("[{}] {}", level.as_str(), message)),
        }

        output
    }
}

/// Convenience macros for logging
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Warning, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Notice, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

/// Internal function to log with level
pub fn log_with_level(level: LogLevel, target: &str, message: &str) {
    CAPTURE.with(|capture| {
        if let Some(records) = capture.borrow_mut().as_mut() {
            records.push(CapturedRecord {
                level,
                target: target.to_string(),
                message: message.to_string(),
            });
        }
    });

    if let Ok(logger_guard) = LOGGER.lock() {
        if let Some(ref logger) = *logger_guard {
            logger.log(level, target, message);
        }
    }
}

/// Run `f` while collecting every record logged on the current thread.
///
/// Records are still forwarded to the global logger. Nested captures are
/// merged into the outermost one.
pub fn capture<T>(f: impl FnOnce() -> T) -> (T, Vec<CapturedRecord>) {
    let outermost = CAPTURE.with(|capture| {
        let mut slot = capture.borrow_mut();
        if slot.is_some() {
            false
        } else {
            *slot = Some(Vec::new());
            true
        }
    });

    let value = f();

    let records = if outermost {
        CAPTURE.with(|capture| capture.borrow_mut().take().unwrap_or_default())
    } else {
        Vec::new()
    };

    (value, records)
}

/// Systemd-style task starting message
pub fn log_task_start(task_name: &str) {
    let message = format!("[*] {}... ", task_name);
    log_with_level(LogLevel::Notice, module_path!(), &message);
}

/// Systemd-style task completion with details
pub fn log_task_complete_with_details(task_name: &str, details: &str) {
    let message = format!("[   OK   ] {} ({})", task_name, details);
    log_with_level(LogLevel::Info, module_path!(), &message);
}

/// Systemd-style failure message with FAILED status
pub fn log_init_failed(service_name: &str, error: &str) {
    let message = format!("[  FAILED ] Starting {} - {}", service_name, error);
    log_with_level(LogLevel::Error, module_path!(), &message);
}
