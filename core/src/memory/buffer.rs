use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::BufferConfig;

/// Sustained throughput multiple of `max` above which the buffer is pinned.
const PIN_FACTOR: u64 = 10;

/// Read-buffer size for `observed` bytes seen since the last reset.
///
/// The result is always within `[min, max]`. When `min > max` the bounds are
/// swapped rather than panicking.
pub fn compute_buffer_size(observed: u64, min: usize, max: usize) -> usize {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if observed > (hi as u64).saturating_mul(PIN_FACTOR) {
        return hi;
    }
    let target = usize::try_from(observed / 8).unwrap_or(hi);
    target.clamp(lo, hi)
}

/// Tracks throughput for one output pump and decides when to resize.
#[derive(Debug)]
pub struct AdaptiveBuffer {
    min: usize,
    max: usize,
    recompute_interval: Duration,
    recompute_after: u64,
    size: usize,
    observed: u64,
    last_reset: Instant,
}

impl AdaptiveBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        let size = compute_buffer_size(0, config.min_bytes, config.max_bytes);
        Self {
            min: config.min_bytes,
            max: config.max_bytes,
            recompute_interval: config.recompute_interval(),
            recompute_after: config.recompute_after_bytes,
            size,
            observed: 0,
            last_reset: Instant::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Records a read. Returns the new size when a recompute happened.
    pub fn record(&mut self, bytes: usize) -> Option<usize> {
        self.observed = self.observed.saturating_add(bytes as u64);
        let due = self.observed >= self.recompute_after
            || self.last_reset.elapsed() >= self.recompute_interval;
        if !due {
            return None;
        }
        self.size = compute_buffer_size(self.observed, self.min, self.max);
        self.observed = 0;
        self.last_reset = Instant::now();
        Some(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const MIN: usize = 1024;
    const MAX: usize = 16 * 1024;

    #[test]
    fn idle_streams_shrink_to_min() {
        assert_eq!(compute_buffer_size(0, MIN, MAX), MIN);
        assert_eq!(compute_buffer_size(4_000, MIN, MAX), MIN);
    }

    #[test]
    fn moderate_throughput_scales_by_eighth() {
        assert_eq!(compute_buffer_size(64 * 1024, MIN, MAX), 8 * 1024);
    }

    #[test]
    fn sustained_throughput_pins_to_max() {
        assert_eq!(compute_buffer_size(10 * MAX as u64 + 1, MIN, MAX), MAX);
        assert_eq!(compute_buffer_size(u64::MAX, MIN, MAX), MAX);
    }

    #[test]
    fn inverted_bounds_do_not_panic() {
        assert_eq!(compute_buffer_size(0, MAX, MIN), MIN);
    }

    #[tokio::test(start_paused = true)]
    async fn recompute_triggers_on_bytes_or_interval() {
        let mut buffer = AdaptiveBuffer::new(&BufferConfig {
            min_bytes: MIN,
            max_bytes: MAX,
            recompute_interval_secs: 300,
            recompute_after_bytes: 1024 * 1024,
        });
        assert_eq!(buffer.size(), MIN);
        assert_eq!(buffer.record(512 * 1024), None);
        assert_eq!(buffer.record(512 * 1024), Some(MAX));
        assert_eq!(buffer.observed(), 0);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(buffer.record(100), Some(MIN));
    }

    proptest! {
        #[test]
        fn size_always_within_bounds(
            observed in any::<u64>(),
            min in 1usize..64 * 1024,
            extra in 0usize..64 * 1024,
        ) {
            let max = min + extra;
            let size = compute_buffer_size(observed, min, max);
            prop_assert!(size >= min && size <= max);
        }

        #[test]
        fn size_is_monotonic_in_throughput(a in any::<u64>(), b in any::<u64>()) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(compute_buffer_size(lo, MIN, MAX) <= compute_buffer_size(hi, MIN, MAX));
        }
    }
}
