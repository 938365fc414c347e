//! Fixed-window call-rate budget
//!
//! The CRM enforces a hard call ceiling per time window; exceeding it gets
//! the integration blocked, not just throttled. [`RateBudget`] is the single
//! gate every outgoing request acquires from first. It counts calls against
//! the window, trusts the remote's own `X-RateLimit-*` headers over its local
//! count, and paces proactively when the remaining budget runs low.
//!
//! Mutable state lives behind a `std::sync::Mutex`; waiting always happens
//! outside the lock via `tokio::time::sleep`, so a blocked `acquire` never
//! holds up `observe` calls from in-flight responses.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use pipesync_core::ports::state_repository::RateBudgetSnapshot;

/// Errors surfaced by budget acquisition
#[derive(Debug, Error)]
pub enum BudgetError {
    /// The budget could not be acquired within the caller's deadline
    #[error("rate budget exhausted: {requested} call(s) not available within {timeout:?}")]
    Timeout {
        requested: u32,
        timeout: Duration,
    },
    /// More calls requested than one window can ever grant
    #[error("requested {requested} calls but the window limit is {limit}")]
    ExceedsWindow { requested: u32, limit: u32 },
}

#[derive(Debug)]
struct BudgetInner {
    /// When the current window opened
    window_started_at: DateTime<Utc>,
    /// Calls consumed in the current window (local count)
    calls_used: u32,
    /// Remaining budget as last reported by the remote, if any
    remote_remaining: Option<u32>,
}

/// What `acquire` decided while holding the lock; any sleeping happens
/// after the guard is released
enum Acquired {
    /// Budget granted, no pacing needed
    Proceed,
    /// Budget granted but the low-water mark was crossed
    Pace(Duration),
    /// Budget spent; wait this long for the window to roll over, then retry
    WaitForReset(Duration),
}

/// Fixed-window call budget shared by all remote calls
#[derive(Debug)]
pub struct RateBudget {
    /// Calls allowed per window
    window_limit: u32,
    /// Window length
    window: Duration,
    /// Remaining-percentage threshold below which calls are paced
    low_water_percent: u8,
    /// Delay inserted per call while below the low-water mark
    pacing_delay: Duration,
    inner: Mutex<BudgetInner>,
}

impl RateBudget {
    /// Creates a budget with a full window starting now
    pub fn new(
        window_limit: u32,
        window: Duration,
        low_water_percent: u8,
        pacing_delay: Duration,
    ) -> Self {
        Self {
            window_limit,
            window,
            low_water_percent,
            pacing_delay,
            inner: Mutex::new(BudgetInner {
                window_started_at: Utc::now(),
                calls_used: 0,
                remote_remaining: None,
            }),
        }
    }

    /// Returns the configured per-window limit
    pub fn window_limit(&self) -> u32 {
        self.window_limit
    }

    /// Rolls the window forward if it has elapsed, then returns the
    /// remaining budget. Caller holds the lock.
    fn remaining_locked(&self, inner: &mut BudgetInner, now: DateTime<Utc>) -> u32 {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        if now - inner.window_started_at >= window {
            debug!(
                calls_used = inner.calls_used,
                "rate budget window rolled over"
            );
            inner.window_started_at = now;
            inner.calls_used = 0;
            inner.remote_remaining = None;
        }
        let local = self.window_limit.saturating_sub(inner.calls_used);
        // The remote's own accounting wins when it reports less than we
        // counted (other clients may share the same budget).
        match inner.remote_remaining {
            Some(remote) => local.min(remote),
            None => local,
        }
    }

    /// Acquires budget for `requested` calls, waiting up to `timeout`
    ///
    /// Waits cooperatively for the window to roll over when the budget is
    /// spent. Fails fast when the wait provably exceeds the deadline, so a
    /// sync session can park itself instead of spinning.
    pub async fn acquire(&self, requested: u32, timeout: Duration) -> Result<(), BudgetError> {
        if requested > self.window_limit {
            return Err(BudgetError::ExceedsWindow {
                requested,
                limit: self.window_limit,
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // The guard never lives across an await: the lock scope only
            // decides what to do, the sleeping happens below.
            let decision = {
                let mut inner = self.inner.lock().unwrap();
                let now = Utc::now();
                let remaining = self.remaining_locked(&mut inner, now);

                if remaining >= requested {
                    inner.calls_used += requested;
                    let left = remaining - requested;
                    let low_water =
                        (self.window_limit as u64 * self.low_water_percent as u64 / 100) as u32;
                    if left <= low_water {
                        Acquired::Pace(self.pacing_delay)
                    } else {
                        Acquired::Proceed
                    }
                } else {
                    // Budget spent: wait for the window to roll over
                    let window = chrono::Duration::from_std(self.window)
                        .unwrap_or(chrono::Duration::zero());
                    let reset_at = inner.window_started_at + window;
                    let until_reset = (reset_at - now)
                        .to_std()
                        .unwrap_or(Duration::from_millis(10));

                    if tokio::time::Instant::now() + until_reset > deadline {
                        warn!(
                            requested,
                            remaining, "rate budget exhausted past the caller's deadline"
                        );
                        return Err(BudgetError::Timeout { requested, timeout });
                    }
                    Acquired::WaitForReset(until_reset)
                }
            };

            match decision {
                Acquired::Proceed => return Ok(()),
                Acquired::Pace(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "pacing: budget low");
                    tokio::time::sleep(delay).await;
                    return Ok(());
                }
                Acquired::WaitForReset(wait) => {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Folds the remote's rate headers into the budget
    ///
    /// `remaining` is the remote's authoritative count of calls left in the
    /// current window. Called from response handling for every API call.
    pub fn observe(&self, remaining: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.remote_remaining = Some(remaining);
        // Keep the local count consistent so a window rollover behaves
        let implied_used = self.window_limit.saturating_sub(remaining);
        if implied_used > inner.calls_used {
            inner.calls_used = implied_used;
        }
    }

    /// Remaining budget right now (rolls the window if elapsed)
    pub fn remaining(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        self.remaining_locked(&mut inner, Utc::now())
    }

    /// Captures the budget state for persistence across restarts
    pub fn snapshot(&self) -> RateBudgetSnapshot {
        let inner = self.inner.lock().unwrap();
        RateBudgetSnapshot {
            window_started_at: inner.window_started_at,
            calls_used: inner.calls_used,
        }
    }

    /// Restores persisted state, if its window is still current
    ///
    /// A restart must not mint a fresh budget mid-window; a snapshot whose
    /// window has since elapsed is simply ignored.
    pub fn restore(&self, snapshot: &RateBudgetSnapshot) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        if Utc::now() - snapshot.window_started_at < window {
            let mut inner = self.inner.lock().unwrap();
            inner.window_started_at = snapshot.window_started_at;
            inner.calls_used = inner.calls_used.max(snapshot.calls_used);
            debug!(
                calls_used = inner.calls_used,
                "restored rate budget from snapshot"
            );
        }
    }
}
