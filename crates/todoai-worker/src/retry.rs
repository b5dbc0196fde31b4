//! Backoff for broker start-up and outage logging for periodic loops.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Doubling delays between connection attempts, capped per step, for a
/// bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    /// Five retries starting at 500ms, capped at 10s.
    pub fn startup() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10), 5)
    }

    pub fn new(initial: Duration, cap: Duration, retries: u32) -> Self {
        Self {
            next: initial.min(cap),
            cap,
            remaining: retries,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        Some(delay)
    }
}

/// Call `connect` until it succeeds, sleeping through `backoff` between
/// failures. Returns the last error once the delays run out.
pub async fn connect_with_backoff<F, Fut, T, E>(
    service: &str,
    backoff: Backoff,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = backoff;
    let mut failures = 0u32;
    loop {
        let err = match connect().await {
            Ok(conn) => {
                if failures > 0 {
                    info!(service, failures, "Connected after retries");
                }
                return Ok(conn);
            }
            Err(e) => e,
        };
        failures += 1;
        let Some(delay) = delays.next() else {
            return Err(err);
        };
        warn!(service, failures, retry_in_ms = delay.as_millis() as u64, "Connect failed: {}", err);
        tokio::time::sleep(delay).await;
    }
}

/// Rate-limits error logs of a periodic task: the first `burst` failures of a
/// streak are logged, the rest are counted and reported when the streak ends.
#[derive(Debug)]
pub struct OutageLog {
    task: &'static str,
    burst: u32,
    streak: u32,
}

impl OutageLog {
    pub fn new(task: &'static str, burst: u32) -> Self {
        Self {
            task,
            burst,
            streak: 0,
        }
    }

    /// Record a failed run, logging it unless the streak is past `burst`.
    pub fn failed(&mut self, err: &dyn std::fmt::Display) {
        self.streak = self.streak.saturating_add(1);
        if self.streak <= self.burst {
            warn!(task = self.task, streak = self.streak, "Run failed: {}", err);
        } else if self.streak == self.burst + 1 {
            warn!(task = self.task, "Still failing, muting errors until recovery");
        }
    }

    pub fn succeeded(&mut self) {
        if self.streak > self.burst {
            info!(task = self.task, failed_runs = self.streak, "Recovered");
        }
        self.streak = 0;
    }

    /// Consecutive failed runs.
    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_then_caps() {
        let delays: Vec<Duration> =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 5).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
        assert_eq!(Backoff::startup().count(), 5);
    }

    #[test]
    fn test_outage_log_streaks() {
        let mut log = OutageLog::new("gc", 2);
        for _ in 0..4 {
            log.failed(&"broker down");
        }
        assert_eq!(log.streak(), 4);
        log.succeeded();
        assert_eq!(log.streak(), 0);
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3);

        let conn = connect_with_backoff("redis", backoff, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("refused") } else { Ok("conn") } }
        })
        .await;

        assert_eq!(conn, Ok("conn"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 2);

        let conn: Result<(), String> = connect_with_backoff("redis", backoff, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("refused #{n}")) }
        })
        .await;

        assert_eq!(conn, Err("refused #2".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
