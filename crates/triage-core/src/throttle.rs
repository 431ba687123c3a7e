use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

/// Time source for the limiter. Tests inject a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottlePolicy {
    Disabled,
    /// Minimum spacing between consecutive request starts.
    FixedDelay(Duration),
    /// At most `max_requests` request starts inside any sliding `window`.
    Window {
        max_requests: usize,
        window: Duration,
    },
}

#[derive(Default)]
struct ThrottleState {
    last_start: Option<Instant>,
    starts: VecDeque<Instant>,
}

/// Client-side pacing of model requests. One limiter is shared by every
/// request issued from the same engine.
pub struct RateLimiter {
    policy: ThrottlePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<ThrottleState>,
}

impl RateLimiter {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self::with_clock(policy, Arc::new(TokioClock))
    }

    pub fn with_clock(policy: ThrottlePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Claims the next request slot and returns how long the caller has to
    /// wait before using it. The slot is booked immediately so concurrent
    /// callers queue up behind each other.
    pub fn reserve(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match &self.policy {
            ThrottlePolicy::Disabled => Duration::ZERO,
            ThrottlePolicy::FixedDelay(spacing) => {
                let slot = match state.last_start {
                    Some(last) => (last + *spacing).max(now),
                    None => now,
                };
                state.last_start = Some(slot);
                slot.saturating_duration_since(now)
            }
            ThrottlePolicy::Window {
                max_requests,
                window,
            } => {
                let max_requests = (*max_requests).max(1);
                while state
                    .starts
                    .front()
                    .is_some_and(|start| *start + *window <= now)
                {
                    state.starts.pop_front();
                }
                let slot = if state.starts.len() < max_requests {
                    now
                } else {
                    let oldest_in_window = state.starts[state.starts.len() - max_requests];
                    (oldest_in_window + *window).max(now)
                };
                state.starts.push_back(slot);
                while state.starts.len() > max_requests {
                    state.starts.pop_front();
                }
                state.last_start = Some(slot);
                slot.saturating_duration_since(now)
            }
        }
    }

    /// Waits for a request slot, giving up early on cancellation.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let delay = self.reserve();
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "throttling model request");
        }
        sleep_or_cancel(delay, cancel).await
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }
    }

    #[test]
    fn disabled_policy_never_waits() {
        let limiter = RateLimiter::new(ThrottlePolicy::Disabled);
        for _ in 0..10 {
            assert_eq!(limiter.reserve(), Duration::ZERO);
        }
    }

    #[test]
    fn fixed_delay_spaces_back_to_back_requests() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            ThrottlePolicy::FixedDelay(Duration::from_millis(500)),
            clock.clone(),
        );
        assert_eq!(limiter.reserve(), Duration::ZERO);
        assert_eq!(limiter.reserve(), Duration::from_millis(500));
        assert_eq!(limiter.reserve(), Duration::from_millis(1000));

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.reserve(), Duration::ZERO);
    }

    #[test]
    fn window_policy_holds_requests_until_the_oldest_expires() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            ThrottlePolicy::Window {
                max_requests: 2,
                window: Duration::from_secs(10),
            },
            clock.clone(),
        );
        assert_eq!(limiter.reserve(), Duration::ZERO);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.reserve(), Duration::ZERO);
        // Third start has to wait until the first one leaves the window.
        assert_eq!(limiter.reserve(), Duration::from_secs(9));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.reserve(), Duration::ZERO);
    }

    #[tokio::test]
    async fn acquire_returns_cancelled_while_waiting() {
        let limiter = RateLimiter::new(ThrottlePolicy::FixedDelay(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.expect("first slot is free");

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });
        let err = limiter.acquire(&cancel).await.expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
