//! Rate Limiting
//!
//! Fixed-window counters per session: requests per minute, requests per
//! hour, and a 24 h token allowance.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_ai_orchestrator::security::rate_limit::SessionLimiter;
//! use tokio_ai_orchestrator::RateWindow;
//!
//! let limiter = SessionLimiter::new(10, 100, 50_000);
//! if limiter.check_rate_limit("session-1234", RateWindow::Minute).allowed {
//!     // Process request
//! }
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    /// 60 seconds.
    Minute,
    /// 3600 seconds.
    Hour,
    /// 24 hours (token allowance).
    Day,
}

impl RateWindow {
    /// Window length.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
            Self::Day => Duration::from_secs(24 * 3600),
        }
    }
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        })
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Units used in the current window after this check.
    pub used: u64,
    /// Units left in the current window.
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_in: Duration,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    reset_at: Instant,
}

/// Per-session counters. Each window starts on first use.
#[derive(Debug, Default)]
struct SecuritySession {
    minute: Option<WindowCounter>,
    hour: Option<WindowCounter>,
    tokens: Option<WindowCounter>,
}

impl SecuritySession {
    /// Whether any window still holds state at `now`.
    fn is_live(&self, now: Instant) -> bool {
        [&self.minute, &self.hour, &self.tokens]
            .into_iter()
            .any(|c| c.is_some_and(|c| c.reset_at > now))
    }

    fn slot(&mut self, window: RateWindow) -> &mut Option<WindowCounter> {
        match window {
            RateWindow::Minute => &mut self.minute,
            RateWindow::Hour => &mut self.hour,
            RateWindow::Day => &mut self.tokens,
        }
    }
}

/// Current counter for a window, rolled over if it has expired.
fn live_counter(
    slot: &mut Option<WindowCounter>,
    now: Instant,
    window: Duration,
) -> &mut WindowCounter {
    let counter = slot.get_or_insert(WindowCounter {
        count: 0,
        reset_at: now + window,
    });
    if counter.reset_at <= now {
        counter.count = 0;
        counter.reset_at = now + window;
    }
    counter
}

/// Decision for adding `amount` to `counter`, without adding it.
fn decide(counter: &WindowCounter, now: Instant, limit: u64, amount: u64) -> RateLimitDecision {
    let allowed = counter.count.saturating_add(amount) <= limit;
    let used = if allowed {
        counter.count + amount
    } else {
        counter.count
    };
    RateLimitDecision {
        allowed,
        used,
        remaining: limit.saturating_sub(used),
        reset_in: counter.reset_at.saturating_duration_since(now),
    }
}

/// Charge `amount` against a window; denial leaves the count untouched.
fn charge(
    slot: &mut Option<WindowCounter>,
    now: Instant,
    window: Duration,
    limit: u64,
    amount: u64,
) -> RateLimitDecision {
    let counter = live_counter(slot, now, window);
    let decision = decide(counter, now, limit, amount);
    if decision.allowed {
        counter.count += amount;
    }
    decision
}

/// Snapshot of one session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionUsage {
    /// Requests in the current minute window.
    pub minute_requests: u64,
    /// Requests in the current hour window.
    pub hour_requests: u64,
    /// Tokens in the current 24 h window.
    pub daily_tokens: u64,
}

/// Fixed-window limiter keyed by session id.
pub struct SessionLimiter {
    sessions: DashMap<String, SecuritySession>,
    per_minute: u64,
    per_hour: u64,
    daily_tokens: u64,
}

impl SessionLimiter {
    /// Create a limiter.
    ///
    /// - `per_minute`, `per_hour`: request allowances
    /// - `daily_tokens`: 24 h token allowance
    pub fn new(per_minute: u32, per_hour: u32, daily_tokens: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            per_minute: u64::from(per_minute),
            per_hour: u64::from(per_hour),
            daily_tokens,
        }
    }

    fn limit_for(&self, window: RateWindow) -> u64 {
        match window {
            RateWindow::Minute => self.per_minute,
            RateWindow::Hour => self.per_hour,
            RateWindow::Day => self.daily_tokens,
        }
    }

    /// Count one request against `window`.
    pub fn check_rate_limit(&self, session_id: &str, window: RateWindow) -> RateLimitDecision {
        self.charge(session_id, window, 1)
    }

    /// Count one request against both the minute and hour windows.
    ///
    /// Both windows are checked before either is charged, so a request
    /// denied by one window consumes nothing from the other. Returns the
    /// denying window, or the minute window when allowed.
    pub fn check_request(&self, session_id: &str) -> (RateWindow, RateLimitDecision) {
        let now = Instant::now();
        let minute_len = RateWindow::Minute.duration();
        let hour_len = RateWindow::Hour.duration();

        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        let session = entry.value_mut();
        let minute = decide(
            live_counter(&mut session.minute, now, minute_len),
            now,
            self.per_minute,
            1,
        );
        let hour = decide(
            live_counter(&mut session.hour, now, hour_len),
            now,
            self.per_hour,
            1,
        );
        let outcome = if !minute.allowed {
            (RateWindow::Minute, minute)
        } else if !hour.allowed {
            (RateWindow::Hour, hour)
        } else {
            live_counter(&mut session.minute, now, minute_len).count += 1;
            live_counter(&mut session.hour, now, hour_len).count += 1;
            (RateWindow::Minute, minute)
        };
        drop(entry);

        let (window, decision) = outcome;
        if decision.allowed {
            debug!(session_id, used = decision.used, "request rate check passed");
        } else {
            warn!(session_id, %window, used = decision.used, "rate limit exceeded");
        }
        outcome
    }

    /// Reserve `requested` tokens against the 24 h allowance.
    ///
    /// A request that would exceed the allowance is denied and reserves nothing.
    pub fn check_token_usage(&self, session_id: &str, requested: u64) -> RateLimitDecision {
        self.charge(session_id, RateWindow::Day, requested)
    }

    fn charge(&self, session_id: &str, window: RateWindow, amount: u64) -> RateLimitDecision {
        let now = Instant::now();
        let limit = self.limit_for(window);

        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        let decision = charge(entry.slot(window), now, window.duration(), limit, amount);
        drop(entry);

        if decision.allowed {
            debug!(session_id, %window, used = decision.used, limit, "rate limit check passed");
        } else {
            warn!(
                session_id,
                %window,
                used = decision.used,
                requested = amount,
                limit,
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Current counters for a session, if it has been seen.
    pub fn get_usage(&self, session_id: &str) -> Option<SessionUsage> {
        let now = Instant::now();
        let live = |c: &Option<WindowCounter>| match c {
            Some(c) if c.reset_at > now => c.count,
            _ => 0,
        };
        self.sessions.get(session_id).map(|s| SessionUsage {
            minute_requests: live(&s.minute),
            hour_requests: live(&s.hour),
            daily_tokens: live(&s.tokens),
        })
    }

    /// Forget a session.
    pub fn reset(&self, session_id: &str) {
        self.sessions.remove(session_id);
        debug!(session_id, "rate limit reset");
    }

    /// Forget every session.
    pub fn reset_all(&self) {
        self.sessions.clear();
    }

    /// Drop sessions whose every window has expired. Returns how many went.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.is_live(now));
        before.saturating_sub(self.sessions.len())
    }

    /// Number of sessions with state.
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_allows_up_to_limit() {
        let limiter = SessionLimiter::new(3, 100, 1_000);
        for _ in 0..3 {
            assert!(limiter.check_rate_limit("s1", RateWindow::Minute).allowed);
        }
        let denied = limiter.check_rate_limit("s1", RateWindow::Minute);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_in <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_elapse() {
        let limiter = SessionLimiter::new(1, 100, 1_000);
        assert!(limiter.check_rate_limit("s1", RateWindow::Minute).allowed);
        assert!(!limiter.check_rate_limit("s1", RateWindow::Minute).allowed);

        tokio::time::advance(Duration::from_secs(61)).await;

        let after = limiter.check_rate_limit("s1", RateWindow::Minute);
        assert!(after.allowed);
        assert_eq!(after.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let limiter = SessionLimiter::new(1, 100, 1_000);
        assert!(limiter.check_rate_limit("a", RateWindow::Minute).allowed);
        assert!(limiter.check_rate_limit("b", RateWindow::Minute).allowed);
        assert_eq!(limiter.tracked_sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_and_hour_windows_count_separately() {
        let limiter = SessionLimiter::new(10, 2, 1_000);
        assert!(limiter.check_rate_limit("s", RateWindow::Hour).allowed);
        assert!(limiter.check_rate_limit("s", RateWindow::Hour).allowed);
        assert!(!limiter.check_rate_limit("s", RateWindow::Hour).allowed);
        assert!(limiter.check_rate_limit("s", RateWindow::Minute).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_denial_does_not_mutate() {
        let limiter = SessionLimiter::new(10, 100, 1_000);
        assert!(limiter.check_token_usage("s", 900).allowed);

        let denied = limiter.check_token_usage("s", 200);
        assert!(!denied.allowed);
        assert_eq!(denied.used, 900);
        assert_eq!(limiter.get_usage("s").unwrap().daily_tokens, 900);

        assert!(limiter.check_token_usage("s", 100).allowed);
        assert!(!limiter.check_token_usage("s", 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_window_resets_after_a_day() {
        let limiter = SessionLimiter::new(10, 100, 100);
        assert!(limiter.check_token_usage("s", 100).allowed);
        tokio::time::advance(Duration::from_secs(24 * 3600 + 1)).await;
        assert!(limiter.check_token_usage("s", 100).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_denial_leaves_minute_window_untouched() {
        let limiter = SessionLimiter::new(10, 2, 1_000);
        assert!(limiter.check_request("s").1.allowed);
        assert!(limiter.check_request("s").1.allowed);

        let (window, denied) = limiter.check_request("s");
        assert_eq!(window, RateWindow::Hour);
        assert!(!denied.allowed);

        let usage = limiter.get_usage("s").unwrap();
        assert_eq!(usage.minute_requests, 2);
        assert_eq!(usage.hour_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_denial_leaves_hour_window_untouched() {
        let limiter = SessionLimiter::new(1, 100, 1_000);
        assert!(limiter.check_request("s").1.allowed);

        let (window, denied) = limiter.check_request("s");
        assert_eq!(window, RateWindow::Minute);
        assert!(!denied.allowed);
        assert_eq!(limiter.get_usage("s").unwrap().hour_requests, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let (_, after) = limiter.check_request("s");
        assert!(after.allowed);
        assert_eq!(limiter.get_usage("s").unwrap().hour_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_only_fully_expired_sessions() {
        let limiter = SessionLimiter::new(10, 100, 1_000);
        assert!(limiter.check_request("idle").1.allowed);
        tokio::time::advance(Duration::from_secs(3_000)).await;
        assert!(limiter.check_request("active").1.allowed);

        // Nothing has fully expired yet: "idle" still has an hour window.
        assert_eq!(limiter.prune_expired(), 0);

        tokio::time::advance(Duration::from_secs(700)).await;
        assert_eq!(limiter.prune_expired(), 1);
        assert_eq!(limiter.tracked_sessions(), 1);
        assert!(limiter.get_usage("idle").is_none());

        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert_eq!(limiter.prune_expired(), 1);
        assert_eq!(limiter.tracked_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_allowance_keeps_session_alive() {
        let limiter = SessionLimiter::new(10, 100, 1_000);
        assert!(limiter.check_token_usage("s", 10).allowed);
        tokio::time::advance(Duration::from_secs(2 * 3600)).await;
        assert_eq!(limiter.prune_expired(), 0);
        assert_eq!(limiter.get_usage("s").unwrap().daily_tokens, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_session() {
        let limiter = SessionLimiter::new(1, 100, 1_000);
        assert!(limiter.check_rate_limit("s", RateWindow::Minute).allowed);
        limiter.reset("s");
        assert!(limiter.get_usage("s").is_none());
        assert!(limiter.check_rate_limit("s", RateWindow::Minute).allowed);
    }
}
