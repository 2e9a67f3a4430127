//! Adaptive poll delay for the dispatch scheduler.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::DispatcherConfig;

/// Poll backoff: decides how long the scheduler sleeps between cycles.
///
/// - a cycle with records resets to `base`
/// - the Nth consecutive empty cycle waits `min(max, base * multiplier^(N-1))`
/// - empty cycles only start counting once the idle span (time since the
///   first empty cycle of the run) reaches `idle_threshold`; before that
///   the delay stays at `base`
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    idle_threshold: Duration,
    empty_streak: u32,
    idle_since: Option<Instant>,
    current: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64, idle_threshold: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: multiplier.max(1.0),
            idle_threshold,
            empty_streak: 0,
            idle_since: None,
            current: base,
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            config.base_poll_interval(),
            config.max_poll_interval(),
            config.backoff_multiplier,
            config.idle_threshold(),
        )
    }

    /// A cycle returned at least one record.
    pub fn on_records(&mut self) -> Duration {
        self.empty_streak = 0;
        self.idle_since = None;
        self.current = self.base;
        self.current
    }

    /// A cycle returned nothing.
    pub fn on_empty(&mut self, now: Instant) -> Duration {
        let since = *self.idle_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.idle_threshold {
            self.current = self.base;
            return self.current;
        }
        self.empty_streak = self.empty_streak.saturating_add(1);
        self.current = self.delay_for_streak(self.empty_streak);
        self.current
    }

    pub fn delay_for_streak(&self, streak: u32) -> Duration {
        if streak <= 1 {
            return self.base;
        }
        let exponent = i32::try_from(streak - 1).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).min(self.max)
    }

    pub fn empty_streak(&self) -> u32 {
        self.empty_streak
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.idle_since.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn backoff() -> PollBackoff {
        PollBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
            Duration::ZERO,
        )
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    #[case(5, 1000)]
    #[case(6, 1000)]
    fn nth_empty_cycle_delay(#[case] n: u32, #[case] expected_ms: u64) {
        let mut b = backoff();
        let now = Instant::now();
        let mut delay = Duration::ZERO;
        for _ in 0..n {
            delay = b.on_empty(now);
        }
        assert_eq!(delay, Duration::from_millis(expected_ms));
        assert_eq!(b.delay_for_streak(n), delay);
    }

    #[test]
    fn one_busy_cycle_resets_to_base() {
        let mut b = backoff();
        let now = Instant::now();
        for _ in 0..4 {
            b.on_empty(now);
        }
        assert_eq!(b.current(), Duration::from_millis(800));

        assert_eq!(b.on_records(), Duration::from_millis(100));
        assert_eq!(b.empty_streak(), 0);
        // counting starts over
        assert_eq!(b.on_empty(now), Duration::from_millis(100));
        assert_eq!(b.on_empty(now), Duration::from_millis(200));
    }

    #[test]
    fn idle_threshold_delays_backoff() {
        let mut b = PollBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
            Duration::from_millis(500),
        );
        let start = Instant::now();

        assert_eq!(b.on_empty(start), Duration::from_millis(100));
        assert_eq!(
            b.on_empty(start + Duration::from_millis(300)),
            Duration::from_millis(100)
        );
        assert_eq!(b.empty_streak(), 0);

        // threshold reached: the streak starts counting
        assert_eq!(
            b.on_empty(start + Duration::from_millis(500)),
            Duration::from_millis(100)
        );
        assert_eq!(
            b.on_empty(start + Duration::from_millis(600)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn huge_streak_saturates_at_max() {
        let b = backoff();
        assert_eq!(b.delay_for_streak(u32::MAX), Duration::from_millis(1000));
    }
}
