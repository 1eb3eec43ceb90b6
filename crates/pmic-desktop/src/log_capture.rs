//! Console logger for headless runs. Warnings and errors are also kept in a
//! small ring so a run can end with a summary of what went wrong.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::sim_board::lock;

pub const RING_CAPACITY: usize = 32;

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub at_ms: i64,
    pub level: Level,
    pub message: String,
}

static RING: Mutex<VecDeque<LogEntry>> = Mutex::new(VecDeque::new());

pub struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let at_ms = crate::TIMEBASE.now_ms();
        if record.level() <= Level::Warn {
            let mut ring = lock(&RING);
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(LogEntry {
                at_ms,
                level: record.level(),
                message: format!("{}", record.args()),
            });
        }
        println!("[{:>9} ms] {:<5} {}", at_ms, record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

pub fn init(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Oldest first.
pub fn recent_warnings() -> Vec<LogEntry> {
    lock(&RING).iter().cloned().collect()
}
