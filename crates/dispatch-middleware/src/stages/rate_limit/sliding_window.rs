use super::{Permit, RateLimitAlgorithm};
use crate::keyed::KeyedState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Ring {
    /// Request count per segment, indexed by segment number modulo length.
    counts: Vec<u32>,
    /// Number of the segment `now` falls in, counted from `origin`.
    current: u64,
    origin: Instant,
}

impl Ring {
    fn advance(&mut self, segment: u64) {
        if segment <= self.current {
            return;
        }
        let len = self.counts.len() as u64;
        let steps = segment - self.current;
        if steps >= len {
            self.counts.iter_mut().for_each(|c| *c = 0);
        } else {
            for offset in 1..=steps {
                self.counts[slot(self.current + offset, len)] = 0;
            }
        }
        self.current = segment;
    }

    fn total(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

fn slot(segment: u64, len: u64) -> usize {
    // `len` fits in a u32, so the remainder fits in usize.
    usize::try_from(segment % len).unwrap_or_default()
}

/// Sliding window made of segments.
///
/// The window is split into `segments_per_window` equal segments. A request
/// is admitted while the sum of the last `segments_per_window` segments is
/// below `permit_limit`; capacity comes back one segment at a time as old
/// segments slide out.
#[derive(Debug)]
pub struct SlidingWindow {
    permit_limit: u32,
    segment: Duration,
    segments: u32,
    rings: Arc<KeyedState<Ring>>,
}

impl SlidingWindow {
    /// Creates a sliding window limiter.
    #[must_use]
    pub fn new(permit_limit: u32, window: Duration, segments_per_window: u32) -> Self {
        let segments = segments_per_window.max(1);
        let segment = (window / segments).max(Duration::from_nanos(1));
        Self {
            permit_limit,
            segment,
            segments,
            rings: Arc::new(KeyedState::new(move || Ring {
                counts: vec![0; segments as usize],
                current: 0,
                origin: Instant::now(),
            })),
        }
    }

    fn position(&self, ring: &Ring, now: Instant) -> (u64, Duration) {
        let elapsed = now.saturating_duration_since(ring.origin).as_nanos();
        let segment_nanos = self.segment.as_nanos();
        let number = u64::try_from(elapsed / segment_nanos).unwrap_or(u64::MAX);
        let into_segment = u64::try_from(elapsed % segment_nanos).unwrap_or(0);
        (number, Duration::from_nanos(into_segment))
    }

    /// Time until the oldest segment still holding requests slides out.
    fn retry_after(&self, ring: &Ring, into_segment: Duration) -> Duration {
        let len = u64::from(self.segments);
        let first = (ring.current + 1).saturating_sub(len);
        let oldest = (first..=ring.current)
            .find(|&segment| ring.counts[slot(segment, len)] > 0)
            .unwrap_or(ring.current);
        let segments_left = u32::try_from(oldest + len - ring.current).unwrap_or(self.segments);
        (self.segment * segments_left).saturating_sub(into_segment)
    }
}

impl RateLimitAlgorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn try_acquire(&self, key: &str) -> Result<Permit, Duration> {
        let entry = self.rings.entry(key);
        let now = Instant::now();
        let segment = {
            let mut ring = entry.lock();
            let (segment, into_segment) = self.position(&ring, now);
            ring.advance(segment);
            if ring.total() >= u64::from(self.permit_limit) {
                return Err(self.retry_after(&ring, into_segment));
            }
            let len = ring.counts.len() as u64;
            ring.counts[slot(segment, len)] += 1;
            segment
        };

        let len = u64::from(self.segments);
        Ok(Permit::free().on_rollback(move || {
            let mut ring = entry.lock();
            if ring.current < segment + len {
                let index = slot(segment, len);
                ring.counts[index] = ring.counts[index].saturating_sub(1);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_capacity_returns_segment_by_segment() {
        // 4 segments of 250ms.
        let limiter = SlidingWindow::new(4, Duration::from_secs(1), 4);

        assert!(limiter.try_acquire("k").is_ok());
        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..3 {
            assert!(limiter.try_acquire("k").is_ok());
        }

        // Full; the first request's segment expires at 1000ms.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(limiter.try_acquire("k").unwrap_err(), Duration::from_millis(650));

        tokio::time::advance(Duration::from_millis(650)).await;
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_err());

        // The three requests made at 250ms expire at 1250ms.
        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..3 {
            assert!(limiter.try_acquire("k").is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_idle_clears_ring() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(1), 2);
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_err());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_frees_capacity() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(1), 4);
        let permit = limiter.try_acquire("k").unwrap();
        assert!(limiter.try_acquire("k").is_err());
        permit.rollback();
        assert!(limiter.try_acquire("k").is_ok());
    }
}
