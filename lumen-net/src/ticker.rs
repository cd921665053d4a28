//! Retry ticks on a backoff schedule, ending at a deadline.

use std::time::Duration;

use futures::stream::{self, Stream};
use lumen_core::RetrySchedule;
use tokio::time::{sleep_until, Instant};

const MIN_GAP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Until the deadline.
    pub time_left: Duration,
    /// Until the next tick (capped at the deadline).
    pub till_next: Duration,
}

struct State {
    schedule: RetrySchedule,
    start: Instant,
    deadline: Instant,
    at: Duration,
}

/// Ticks at the schedule's offsets from now. A tick that is polled late fires
/// immediately, and missed offsets are skipped rather than replayed. The stream
/// ends at `timeout`.
pub fn ticks(schedule: RetrySchedule, timeout: Duration) -> impl Stream<Item = Tick> + Send {
    let start = Instant::now();
    let state = State {
        schedule,
        start,
        deadline: start + timeout,
        at: Duration::ZERO,
    };
    stream::unfold(state, |mut st| async move {
        let when = st.start + st.at;
        if when >= st.deadline {
            sleep_until(st.deadline).await;
            return None;
        }
        sleep_until(when).await;
        let now = Instant::now();
        if now >= st.deadline {
            return None;
        }
        let mut next = st.at + st.schedule.next_gap(st.at).max(MIN_GAP);
        while st.start + next <= now {
            next += st.schedule.next_gap(next).max(MIN_GAP);
        }
        st.at = next;
        let tick = Tick {
            time_left: st.deadline - now,
            till_next: (st.start + next).min(st.deadline) - now,
        };
        Some((tick, st))
    })
}
