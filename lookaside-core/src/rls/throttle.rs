use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const THROTTLE_WINDOW: Duration = Duration::from_secs(30);
const THROTTLE_RATIO_FOR_SUCCESSES: f64 = 2.0;
const THROTTLE_PADDING: f64 = 8.0;

/// Adaptive client-side admission control for lookup requests.
///
/// Tracks requests and failures over a rolling window and throttles with
/// probability `(requests - successes * ratio) / (requests + padding)`. A
/// throttled request is recorded as a synthetic failure so recovery ramps up
/// gradually instead of stampeding the lookup service.
#[derive(Debug)]
pub(crate) struct Throttle {
    window: Duration,
    ratio_for_successes: f64,
    padding: f64,
    requests: VecDeque<Instant>,
    failures: VecDeque<Instant>,
    #[cfg(test)]
    pub(crate) forced: Option<bool>,
}

impl Throttle {
    pub fn new() -> Self {
        Throttle {
            window: THROTTLE_WINDOW,
            ratio_for_successes: THROTTLE_RATIO_FOR_SUCCESSES,
            padding: THROTTLE_PADDING,
            requests: VecDeque::new(),
            failures: VecDeque::new(),
            #[cfg(test)]
            forced: None,
        }
    }

    pub fn should_throttle(&mut self, now: Instant) -> bool {
        self.should_throttle_with(now, rand::rng().random::<f64>())
    }

    /// `draw` is a uniform sample from [0, 1).
    pub(crate) fn should_throttle_with(&mut self, now: Instant, draw: f64) -> bool {
        #[cfg(test)]
        if let Some(forced) = self.forced {
            return forced;
        }
        self.evict_expired(now);
        let num_requests = self.requests.len() as f64;
        let num_successes = num_requests - self.failures.len() as f64;
        // May be negative, in which case nothing is throttled.
        let throttle_probability = (num_requests - num_successes * self.ratio_for_successes)
            / (num_requests + self.padding);
        let throttle = draw < throttle_probability;
        if throttle {
            self.requests.push_back(now);
            self.failures.push_back(now);
        }
        throttle
    }

    pub fn register_response(&mut self, success: bool, now: Instant) {
        self.requests.push_back(now);
        if !success {
            self.failures.push_back(now);
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.requests.front()
            && now.duration_since(*front) > self.window
        {
            self.requests.pop_front();
        }
        while let Some(front) = self.failures.front()
            && now.duration_since(*front) > self.window
        {
            self.failures.pop_front();
        }
    }
}
