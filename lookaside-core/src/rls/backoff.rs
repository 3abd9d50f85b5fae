use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 1.6;
const BACKOFF_JITTER: f64 = 0.2;
const BACKOFF_MAX: Duration = Duration::from_secs(2 * 60);

/// Exponential backoff with jitter for failed lookups.
///
/// The first attempt fires exactly `initial` after the failure; later
/// attempts multiply the delay and spread it by the jitter factor, capped at
/// `max`. A cache entry carries its backoff across stale refreshes so
/// repeated failures keep climbing the same ladder.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    multiplier: f64,
    jitter: f64,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn for_cache_entry() -> Self {
        Backoff {
            initial: BACKOFF_INITIAL,
            multiplier: BACKOFF_MULTIPLIER,
            jitter: BACKOFF_JITTER,
            max: BACKOFF_MAX,
            current: None,
        }
    }

    pub fn next_attempt_time(&mut self, now: Instant) -> Instant {
        now + self.next_delay(rand::rng().random::<f64>())
    }

    /// `draw` is a uniform sample from [0, 1).
    pub(crate) fn next_delay(&mut self, draw: f64) -> Duration {
        let Some(current) = self.current else {
            self.current = Some(self.initial);
            return self.initial;
        };
        let next = Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        self.current = Some(next);
        let jittered = next.as_secs_f64() * (1.0 + self.jitter * (2.0 * draw - 1.0));
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_exactly_initial() {
        let mut backoff = Backoff::for_cache_entry();
        assert_eq!(backoff.next_delay(0.99), Duration::from_secs(1));
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let mut backoff = Backoff::for_cache_entry();
        let mut prev = backoff.next_delay(0.5);
        // Worst case for monotonicity: previous delay jittered high, next
        // jittered low. 1.6 * 0.8 still exceeds 1.2, so the ladder climbs.
        let mut draws = vec![1.0 - f64::EPSILON, 0.0, 1.0 - f64::EPSILON, 0.0];
        draws.extend(std::iter::repeat_n(0.5, 16));
        for draw in draws {
            let next = backoff.next_delay(draw);
            assert!(next >= prev, "{next:?} < {prev:?}");
            assert!(next <= Duration::from_secs(120));
            prev = next;
        }
        assert_eq!(prev, Duration::from_secs(120));
    }
}
