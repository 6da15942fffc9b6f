use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Publish counters for the lifetime of the process.
///
/// Shared by every request handler, so counters are atomics and the
/// last publish time sits behind a short-lived lock.
pub struct Stats {
    successful: AtomicU64,
    failed_unavailable: AtomicU64,
    failed_publish: AtomicU64,
    last_publish: Mutex<Option<OffsetDateTime>>,
    started: Instant,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub successful: u64,
    pub failed_unavailable: u64,
    pub failed_publish: u64,
    pub last_publish: Option<OffsetDateTime>,
    pub uptime: Duration,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            successful: AtomicU64::new(0),
            failed_unavailable: AtomicU64::new(0),
            failed_publish: AtomicU64::new(0),
            last_publish: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn record_success(&self, at: OffsetDateTime) {
        self.successful.fetch_add(1, Ordering::SeqCst);
        // A poisoned lock still holds a valid timestamp.
        let mut last = self
            .last_publish
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(at);
    }

    /// Request rejected because the broker was not connected.
    pub fn record_unavailable(&self) {
        self.failed_unavailable.fetch_add(1, Ordering::SeqCst);
    }

    /// The client refused or failed the publish itself.
    pub fn record_publish_error(&self) {
        self.failed_publish.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_publish = *self
            .last_publish
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StatsSnapshot {
            successful: self.successful.load(Ordering::SeqCst),
            failed_unavailable: self.failed_unavailable.load(Ordering::SeqCst),
            failed_publish: self.failed_publish.load(Ordering::SeqCst),
            last_publish,
            uptime: self.started.elapsed(),
        }
    }
}

impl StatsSnapshot {
    pub fn failed(&self) -> u64 {
        self.failed_unavailable + self.failed_publish
    }

    pub fn total(&self) -> u64 {
        self.successful + self.failed()
    }

    pub fn success_rate(&self) -> String {
        success_rate(self.successful, self.failed())
    }
}

/// `"N/A"` until something was attempted, then a two-decimal percentage.
pub fn success_rate(successful: u64, failed: u64) -> String {
    let total = successful + failed;
    if total == 0 {
        return "N/A".to_string();
    }
    format!("{:.2}%", successful as f64 / total as f64 * 100.0)
}

/// Formats whole seconds as `2d 3h 4m 5s`, leaving out zero day/hour/minute parts.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", secs));

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3_600), "1h 0s");
        assert_eq!(format_uptime(86_405), "1d 5s");
        assert_eq!(format_uptime(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5), "2d 3h 4m 5s");
    }

    #[test]
    fn success_rate_formatting() {
        assert_eq!(success_rate(0, 0), "N/A");
        assert_eq!(success_rate(3, 1), "75.00%");
        assert_eq!(success_rate(1, 2), "33.33%");
        assert_eq!(success_rate(0, 4), "0.00%");
        assert_eq!(success_rate(5, 0), "100.00%");
    }

    #[test]
    fn counters_and_breakdown() {
        let stats = Stats::new();
        let before = stats.snapshot();
        assert_eq!(before.total(), 0);
        assert_eq!(before.last_publish, None);
        assert_eq!(before.success_rate(), "N/A");

        let at = OffsetDateTime::UNIX_EPOCH;
        stats.record_success(at);
        stats.record_success(at);
        stats.record_success(at);
        stats.record_unavailable();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.successful, 3);
        assert_eq!(snapshot.failed(), 1);
        assert_eq!(snapshot.failed_unavailable, 1);
        assert_eq!(snapshot.failed_publish, 0);
        assert_eq!(snapshot.last_publish, Some(at));
        assert_eq!(snapshot.success_rate(), "75.00%");

        stats.record_publish_error();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed(), 2);
        assert_eq!(snapshot.total(), 5);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        stats.record_success(OffsetDateTime::now_utc());
                        stats.record_publish_error();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.successful, 8_000);
        assert_eq!(snapshot.failed_publish, 8_000);
    }
}
