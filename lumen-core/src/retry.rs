//! Retry gaps: backoff schedule for resending a packet, and the timing rules
//! used to decide when a request has all the replies it will get.

use std::time::Duration;

/// Backoff used while discovering devices.
pub fn discovery_timeouts() -> Vec<(Duration, Duration)> {
    secs(&[(0.6, 1.8), (1.0, 2.0), (2.0, 6.0), (4.0, 10.0), (5.0, 20.0)])
}

/// Convert `(step, end)` pairs given in seconds.
pub fn secs(pairs: &[(f64, f64)]) -> Vec<(Duration, Duration)> {
    pairs
        .iter()
        .map(|&(step, end)| (millis(step), millis(end)))
        .collect()
}

fn millis(seconds: f64) -> Duration {
    Duration::from_millis((seconds * 1000.0).round().max(0.0) as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryGaps {
    /// With an unbounded number of replies, finished once this long has
    /// passed since the last one.
    pub gap_between_results: Duration,
    /// After an ack arrives, how long to wait for the reply before resending.
    pub gap_between_ack_and_res: Duration,
    /// `(step, end)` pairs: tick every `step` until `end` has elapsed since
    /// the first tick, then move to the next pair. The last step repeats.
    pub timeouts: Vec<(Duration, Duration)>,
}

impl Default for RetryGaps {
    fn default() -> Self {
        Self {
            gap_between_results: Duration::from_millis(400),
            gap_between_ack_and_res: Duration::from_millis(200),
            timeouts: secs(&[(0.2, 0.2), (0.1, 0.5), (0.2, 1.0), (1.0, 5.0)]),
        }
    }
}

impl RetryGaps {
    pub fn with_timeouts(timeouts: Vec<(Duration, Duration)>) -> Self {
        Self {
            timeouts,
            ..Self::default()
        }
    }

    /// Delay before re-checking whether an unbounded request is finished.
    pub fn finish_multi_gap(&self) -> Duration {
        self.gap_between_results + Duration::from_millis(50)
    }

    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule::new(self.timeouts.clone())
    }
}

/// Pure tick schedule. Given the elapsed time of the tick that just fired,
/// returns the gap until the next one.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    remaining: Vec<(Duration, Duration)>,
    step: Duration,
    end: Option<Duration>,
}

impl RetrySchedule {
    pub fn new(timeouts: Vec<(Duration, Duration)>) -> Self {
        let mut remaining: Vec<(Duration, Duration)> = timeouts.into_iter().rev().collect();
        let (step, end) = remaining
            .pop()
            .map(|(s, e)| (s, Some(e)))
            .unwrap_or((Duration::from_millis(100), None));
        Self {
            remaining,
            step,
            end,
        }
    }

    pub fn current_step(&self) -> Duration {
        self.step
    }

    /// Advance past a tick that fired `elapsed` after the first tick.
    pub fn next_gap(&mut self, elapsed: Duration) -> Duration {
        if let Some(end) = self.end {
            if elapsed > end {
                match self.remaining.pop() {
                    Some((step, end)) => {
                        self.step = step;
                        self.end = Some(end);
                    }
                    None => self.end = None,
                }
            }
        }
        self.step
    }

    /// Offsets (from the first tick) of every tick before `timeout`.
    pub fn offsets(mut self, timeout: Duration) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut at = Duration::ZERO;
        while at < timeout {
            out.push(at);
            let gap = self.next_gap(at);
            if gap.is_zero() {
                break;
            }
            at += gap;
        }
        out
    }
}
