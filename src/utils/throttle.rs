//! Log throttling utility
//!
//! Limits how often the same log message is recorded so a camera that keeps
//! failing reads at frame rate does not flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// ```rust
/// use std::time::Duration;
/// use camrtc::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("read_error"));
/// assert!(!throttler.should_log("read_error"));
/// assert_eq!(throttler.suppressed("read_error"), 1);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when the message for `key` should be emitted now
    ///
    /// Throttled calls are counted; the count resets whenever the key is
    /// logged again.
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), returning how many messages were
    /// suppressed since the last emitted one
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last_logged: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Messages suppressed for `key` since it was last logged
    pub fn suppressed(&self, key: &str) -> u64 {
        self.entries.lock().get(key).map_or(0, |e| e.suppressed)
    }

    /// Forget `key`, so the next failure after a recovery is logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled warning
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));
        assert!(!throttler.should_log("key"));
        assert_eq!(throttler.suppressed("key"), 2);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("key"), Some(2));
        assert_eq!(throttler.suppressed("key"), 0);
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));
        throttler.clear("key");
        assert!(throttler.should_log("key"));
    }
}
