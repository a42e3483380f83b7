use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Monotonic stopwatch used for pacing, pruning and watchdog timers.
#[derive(Debug, Clone, Copy)]
pub struct ElapsedTimer {
    started: Instant,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn seconds(&self) -> u64 {
        self.elapsed().as_secs()
    }

    pub fn milliseconds(&self) -> u128 {
        self.elapsed().as_millis()
    }

    pub fn microseconds(&self) -> u128 {
        self.elapsed().as_micros()
    }

    pub fn nanoseconds(&self) -> u128 {
        self.elapsed().as_nanos()
    }
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the value for `key` from a raw query string such as
/// `source=cam1&session=abc`. Returns an empty string when absent.
pub fn query_value(query: &str, key: &str) -> String {
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        if it.next() == Some(key) {
            return it.next().unwrap_or("").to_string();
        }
    }
    String::new()
}

/// Directory of the running executable, falling back to the working dir.
pub fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_value_extraction() {
        assert_eq!(query_value("source=cam1&session=abc", "source"), "cam1");
        assert_eq!(query_value("source=cam1&session=abc", "session"), "abc");
        assert_eq!(query_value("source=cam1", "session"), "");
        assert_eq!(query_value("", "source"), "");
        assert_eq!(query_value("session=", "session"), "");
        // key must match exactly, not as a substring of another key
        assert_eq!(query_value("xsource=evil&source=good", "source"), "good");
    }
}
