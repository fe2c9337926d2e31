//! Per-host rate limiting shared across every worker and download.
//!
//! A 429 from any worker blocks all traffic to that host until the block
//! expires. `blocked_until` only ever extends: concurrent 429s race through
//! a CAS loop and the longest block wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Longest backoff the limiter will impose without server guidance.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Jitter applied to every wait, as a fraction.
const JITTER: f64 = 0.10;

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<HostLimiter>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns the process-wide limiter for `host`, creating it on first use.
#[must_use]
pub fn for_host(host: &str) -> Arc<HostLimiter> {
    let mut registry = REGISTRY.lock().unwrap();
    Arc::clone(
        registry
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostLimiter::new(host))),
    )
}

/// Clears every registered limiter. Intended for tests.
pub fn reset() {
    REGISTRY.lock().unwrap().clear();
}

/// Number of hosts currently tracked. Intended for diagnostics and tests.
#[must_use]
pub fn active_hosts() -> usize {
    REGISTRY.lock().unwrap().len()
}

/// Shared backoff state for one hostname.
#[derive(Debug)]
pub struct HostLimiter {
    host: String,
    /// Unix nanos when the block expires; 0 when clear.
    blocked_until: AtomicI64,
    consecutive_hits: AtomicU32,
    /// Serializes backoff computation so hit counting stays coherent.
    backoff_mu: Mutex<()>,
}

impl HostLimiter {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            blocked_until: AtomicI64::new(0),
            consecutive_hits: AtomicU32::new(0),
            backoff_mu: Mutex::new(()),
        }
    }

    /// The hostname this limiter covers.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Processes a 429 and returns the wait it imposed. `retry_after` is
    /// the raw `Retry-After` header value, if the server sent one.
    pub fn handle_429(&self, retry_after: Option<&str>) -> Duration {
        let _guard = self.backoff_mu.lock().unwrap();
        let hits = self.consecutive_hits.fetch_add(1, Ordering::AcqRel) + 1;

        let mut wait = retry_after.and_then(parse_retry_after).unwrap_or_default();

        if wait.is_zero() {
            // 1s, 2s, 4s ... capped at 60s.
            let exp = (hits - 1).min(5);
            wait = (Duration::from_secs(1) * 2u32.pow(exp)).min(MAX_BACKOFF);
            log::debug!(
                "rate limiter [{}]: 429 without usable Retry-After, backing off {wait:?} (hit #{hits})",
                self.host
            );
        } else {
            log::debug!(
                "rate limiter [{}]: 429 with Retry-After, waiting {wait:?} (hit #{hits})",
                self.host
            );
        }

        let wait = add_jitter(wait, JITTER);
        self.extend_block(wait);
        wait
    }

    /// Extends `blocked_until` if the new deadline is later; concurrent
    /// callers can only lengthen the block.
    fn extend_block(&self, wait: Duration) {
        let deadline = unix_nanos(SystemTime::now() + wait);
        let mut current = self.blocked_until.load(Ordering::Acquire);
        while deadline > current {
            match self.blocked_until.compare_exchange(
                current,
                deadline,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Sleeps out any active block. Returns whether a wait happened.
    pub async fn wait_if_blocked(&self) -> bool {
        let Some(wait) = self.block_duration() else {
            return false;
        };
        log::debug!(
            "rate limiter [{}]: worker waiting {wait:?} for rate limit",
            self.host
        );
        tokio::time::sleep(wait).await;
        true
    }

    /// Resets the consecutive-hit counter after a successful response.
    pub fn report_success(&self) {
        if self.consecutive_hits.swap(0, Ordering::AcqRel) > 0 {
            log::debug!("rate limiter [{}]: success, hit counter reset", self.host);
        }
    }

    /// True while a block is active.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.block_duration().is_some()
    }

    /// The instant the block expires, if one is active.
    #[must_use]
    pub fn blocked_until(&self) -> Option<SystemTime> {
        let nanos = self.blocked_until.load(Ordering::Acquire);
        if nanos <= 0 {
            return None;
        }
        let until = UNIX_EPOCH + Duration::from_nanos(nanos.unsigned_abs());
        (until > SystemTime::now()).then_some(until)
    }

    /// Time left on the active block, if any.
    #[must_use]
    pub fn block_duration(&self) -> Option<Duration> {
        self.blocked_until()
            .and_then(|until| until.duration_since(SystemTime::now()).ok())
            .filter(|d| !d.is_zero())
    }
}

/// Parses `Retry-After`: either delta-seconds or an HTTP-date. A date in
/// the past still imposes the minimum one-second wait.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let now = chrono::Utc::now();
    let delta = date.signed_duration_since(now);
    Some(delta.to_std().unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1)))
}

fn add_jitter(d: Duration, factor: f64) -> Duration {
    if d.is_zero() {
        return d;
    }
    let scale = 1.0 + rand::rng().random_range(-factor..=factor);
    d.mul_f64(scale)
}

fn unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn retry_after_http_date_in_past_waits_minimum() {
        let past = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(past), Some(Duration::from_secs(1)));
    }

    #[test]
    fn retry_after_http_date_in_future() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let wait = parse_retry_after(&future.to_rfc2822()).unwrap();
        assert!(wait > Duration::from_secs(25) && wait <= Duration::from_secs(31));
    }

    #[test]
    fn retry_after_garbage_is_none() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let limiter = HostLimiter::new("example.com");
        let mut last = Duration::ZERO;
        for _ in 0..8 {
            let wait = limiter.handle_429(None);
            // Jitter is ±10%, so compare against a loose bound.
            assert!(wait <= MAX_BACKOFF.mul_f64(1.0 + JITTER));
            last = wait;
        }
        assert!(last >= Duration::from_secs(28));
    }

    #[test]
    fn success_resets_hit_counter() {
        let limiter = HostLimiter::new("example.com");
        limiter.handle_429(None);
        limiter.handle_429(None);
        limiter.report_success();
        // Back to the base delay (1s ± jitter).
        let wait = limiter.handle_429(None);
        assert!(wait <= Duration::from_secs(2));
    }

    #[test]
    fn block_only_extends() {
        let limiter = HostLimiter::new("example.com");
        limiter.handle_429(Some("10"));
        let first = limiter.blocked_until().unwrap();
        limiter.handle_429(Some("1"));
        let second = limiter.blocked_until().unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn wait_if_blocked_sleeps_out_the_block() {
        let limiter = HostLimiter::new("example.com");
        assert!(!limiter.wait_if_blocked().await);

        limiter.extend_block(Duration::from_millis(50));
        let start = std::time::Instant::now();
        assert!(limiter.wait_if_blocked().await);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!limiter.is_blocked());
    }

    #[test]
    fn registry_shares_limiters_per_host() {
        reset();
        let a = for_host("shared.example");
        let b = for_host("shared.example");
        let c = for_host("other.example");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(active_hosts(), 2);
        reset();
    }
}
