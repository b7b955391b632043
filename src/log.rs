//! File-based logging plus user-facing status lines.
//!
//! Structured entries go to .hearth/log/hearth.log as JSONL with ISO 8601
//! timestamps. The supervisor additionally mirrors info/warn/error to its
//! own stderr as colored `[hearth]` lines, since that terminal is where
//! a user watches the tree boot and restart.

use chrono::Utc;
use serde::Serialize;
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// When set, info/warn/error lines are echoed to stderr. Enabled by the
/// supervisor process; client invocations keep their stderr clean for the
/// command's own output.
static ECHO_STDERR: AtomicBool = AtomicBool::new(false);

pub fn enable_stderr_echo() {
    ECHO_STDERR.store(true, Ordering::Release);
}

/// Log entry structure for safe JSON serialization
#[derive(Serialize)]
struct LogEntry<'a> {
    ts: String,
    level: String,
    subsystem: &'a str,
    event: &'a str,
    pid: u32,
    msg: &'a str,
}

/// Append one entry to the hearth log file.
pub fn log(level: &str, subsystem: &str, event: &str, message: &str) {
    // Config may not be initialized in every context that logs (panic hook,
    // unit tests); drop the file entry rather than panic.
    let path = match crate::config::Config::try_get() {
        Some(cfg) => cfg.hearth_dir.join("log").join("hearth.log"),
        None => return,
    };

    // Ensure directory exists
    if let Some(parent) = path.parent() {
        let _ = create_dir_all(parent);
    }

    let entry = LogEntry {
        ts: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        level: level.to_uppercase(),
        subsystem,
        event,
        pid: std::process::id(),
        msg: message,
    };

    // Serialize with serde_json for proper escaping
    let log_line = match serde_json::to_string(&entry) {
        Ok(line) => line,
        Err(_) => return, // Silently fail on serialization error
    };

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", log_line);
    }

    if ECHO_STDERR.load(Ordering::Acquire) {
        let color = match level {
            "warn" => "\x1b[33m",
            "error" => "\x1b[31m",
            _ => "\x1b[36m",
        };
        eprintln!("{}[hearth] {}\x1b[0m", color, message);
    }
}

/// Log info message
pub fn log_info(subsystem: &str, event: &str, message: &str) {
    log("info", subsystem, event, message);
}

/// Log warning message
pub fn log_warn(subsystem: &str, event: &str, message: &str) {
    log("warn", subsystem, event, message);
}

/// Log error message
pub fn log_error(subsystem: &str, event: &str, message: &str) {
    log("error", subsystem, event, message);
}

/// Debug message: file only, and only when HEARTH_DEBUG=1.
pub fn log_debug(subsystem: &str, event: &str, message: &str) {
    if crate::config::Config::debug_enabled() {
        log("debug", subsystem, event, message);
    }
}
