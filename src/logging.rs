use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::RwLock;

pub type LogCallback = Box<dyn Fn(&str, Level) + Send + Sync>;

struct Sink {
    to_stdout: AtomicBool,
    callback: RwLock<Option<LogCallback>>,
}

static SINK: Sink = Sink {
    to_stdout: AtomicBool::new(true),
    callback: RwLock::new(None),
};

impl Log for Sink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = format!("{}", record.args());
        if self.to_stdout.load(Ordering::Relaxed) {
            if record.level() <= Level::Error {
                eprintln!("{}", msg);
            } else {
                println!("{}", msg);
            }
        }
        if let Some(cb) = self.callback.read().as_ref() {
            cb(&msg, record.level());
        }
    }

    fn flush(&self) {}
}

/// Installs the sink as the process logger. Safe to call repeatedly; a
/// logger installed by the host application wins.
pub(crate) fn init() {
    if log::set_logger(&SINK).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

pub fn set_log_to_stdout(flag: bool) {
    SINK.to_stdout.store(flag, Ordering::Relaxed);
}

pub fn set_log_callback<F>(callback: F)
where
    F: Fn(&str, Level) + Send + Sync + 'static,
{
    *SINK.callback.write() = Some(Box::new(callback));
}
