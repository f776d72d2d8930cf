use super::{Permit, RateLimitAlgorithm};
use crate::keyed::KeyedState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    count: u32,
    started_at: Instant,
}

/// Fixed window counter.
///
/// At most `permit_limit` requests per key within each window; the counter
/// resets when a window boundary is crossed. Windows are aligned to the first
/// request seen for the key.
#[derive(Debug)]
pub struct FixedWindow {
    permit_limit: u32,
    window: Duration,
    windows: Arc<KeyedState<Window>>,
}

impl FixedWindow {
    /// Creates a fixed window limiter.
    #[must_use]
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        Self {
            permit_limit,
            window: window.max(Duration::from_nanos(1)),
            windows: Arc::new(KeyedState::new(|| Window {
                count: 0,
                started_at: Instant::now(),
            })),
        }
    }

    fn roll(&self, window: &mut Window, now: Instant) {
        let elapsed = now.saturating_duration_since(window.started_at);
        if elapsed < self.window {
            return;
        }
        let into_current = u64::try_from(elapsed.as_nanos() % self.window.as_nanos()).unwrap_or(0);
        window.started_at = now
            .checked_sub(Duration::from_nanos(into_current))
            .unwrap_or(now);
        window.count = 0;
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn try_acquire(&self, key: &str) -> Result<Permit, Duration> {
        let entry = self.windows.entry(key);
        let now = Instant::now();
        let started_at = {
            let mut window = entry.lock();
            self.roll(&mut window, now);
            if window.count >= self.permit_limit {
                let into_window = now.saturating_duration_since(window.started_at);
                return Err(self.window.saturating_sub(into_window));
            }
            window.count += 1;
            window.started_at
        };

        Ok(Permit::free().on_rollback(move || {
            let mut window = entry.lock();
            if window.started_at == started_at {
                window.count = window.count.saturating_sub(1);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_per_hour() {
        let limiter = FixedWindow::new(1, Duration::from_secs(3600));
        assert!(limiter.try_acquire("k").is_ok());

        let retry_after = limiter.try_acquire("k").unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(limiter.try_acquire("k").unwrap_err(), Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_at_boundary() {
        let limiter = FixedWindow::new(2, Duration::from_secs(1));
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_err());

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_ok());

        // Window boundaries stay on whole seconds from the first request.
        assert_eq!(limiter.try_acquire("k").unwrap_err(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_only_within_same_window() {
        let limiter = FixedWindow::new(1, Duration::from_secs(1));
        let stale = limiter.try_acquire("k").unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let _current = limiter.try_acquire("k").unwrap();

        stale.rollback();
        assert!(limiter.try_acquire("k").is_err());
    }
}
