// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use colored::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, max_level, set_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

const TIME_FORMAT_STR: &str = "%H:%M:%S";

pub type StdioHandler = Box<dyn Fn(&str) -> Result<(), ()> + Send>;

pub static CAPSULE_LOGGER: Lazy<CapsuleLogger> = Lazy::new(CapsuleLogger::new);

/// A leveled, colorized stderr logger that also fans log lines out to any number of registered
/// handlers (used by the bridge and remote facade to capture `BRIDGE`-sourced log records rather
/// than letting them leak straight to the controlling terminal).
pub struct CapsuleLogger {
    use_color: AtomicBool,
    stderr_handlers: Mutex<HashMap<Uuid, StdioHandler>>,
}

impl CapsuleLogger {
    pub fn new() -> CapsuleLogger {
        CapsuleLogger {
            use_color: AtomicBool::new(false),
            stderr_handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn init(max_level: LevelFilter, use_color: bool) {
        set_max_level(max_level);
        CAPSULE_LOGGER.use_color.store(use_color, Ordering::SeqCst);
        if set_logger(&*CAPSULE_LOGGER).is_err() {
            debug!("Logging already initialized.");
        }
    }

    pub fn register_stderr_handler(&self, callback: StdioHandler) -> Uuid {
        let mut handlers = self.stderr_handlers.lock();
        let unique_id = Uuid::new_v4();
        handlers.insert(unique_id, callback);
        unique_id
    }

    pub fn deregister_stderr_handler(&self, unique_id: Uuid) {
        let mut handlers = self.stderr_handlers.lock();
        handlers.remove(&unique_id);
    }
}

impl Log for CapsuleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        use chrono::Timelike;

        let cur_date = chrono::Local::now();
        let time_str = format!(
            "{}.{:02}",
            cur_date.format(TIME_FORMAT_STR),
            cur_date.time().nanosecond() / 10_000_000 // two decimal places of precision
        );

        let level = record.level();
        let use_color = self.use_color.load(Ordering::SeqCst);

        let level_marker = match level {
            _ if !use_color => format!("[{level}]").normal().clear(),
            Level::Info => format!("[{level}]").normal(),
            Level::Error => format!("[{level}]").red(),
            Level::Warn => format!("[{level}]").red(),
            Level::Debug => format!("[{level}]").green(),
            Level::Trace => format!("[{level}]").magenta(),
        };

        let log_string = format!("{time_str} {level_marker} {}", record.args());

        // We first try to output to all registered handlers. If there are none, or any of them
        // fail, then we fall back to sending directly to stderr.
        let handlers_map = self.stderr_handlers.lock();
        let mut any_handler_failed = false;
        for callback in handlers_map.values() {
            if callback(&log_string).is_err() {
                any_handler_failed = true;
            }
        }
        if handlers_map.is_empty() || any_handler_failed {
            eprintln!("{log_string}");
        }
    }

    fn flush(&self) {}
}
