use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

pub trait HealthProbe {
    fn probe(&self, budget: Duration) -> bool;
}

impl<F> HealthProbe for F
where
    F: Fn() -> bool,
{
    fn probe(&self, _budget: Duration) -> bool {
        self()
    }
}

/// Returns the time to readiness, or `None` once `deadline` has passed. Each probe is
/// bounded by `interval`, so a timeout lands at most one interval past the deadline.
pub fn wait_ready<P: HealthProbe + ?Sized>(
    probe: &P,
    deadline: Duration,
    interval: Duration,
) -> Option<Duration> {
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if probe.probe(interval) {
            let elapsed = start.elapsed();
            debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "instance ready");
            return Some(elapsed);
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            debug!(attempts, "readiness deadline elapsed");
            return None;
        }
        thread::sleep(interval.min(deadline - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn returns_immediately_when_probe_succeeds() {
        let latency = wait_ready(&|| true, Duration::from_secs(5), Duration::from_millis(200))
            .expect("ready");
        assert!(latency < Duration::from_millis(200));
    }

    #[test]
    fn succeeds_after_a_few_failures() {
        let calls = Cell::new(0);
        let probe = || {
            calls.set(calls.get() + 1);
            calls.get() >= 3
        };
        let latency = wait_ready(&probe, Duration::from_secs(5), Duration::from_millis(20))
            .expect("ready");
        assert_eq!(calls.get(), 3);
        assert!(latency >= Duration::from_millis(40));
    }

    #[test]
    fn timeout_lands_between_deadline_and_one_interval_after() {
        let deadline = Duration::from_millis(300);
        let interval = Duration::from_millis(100);
        let start = Instant::now();
        let outcome = wait_ready(&|| false, deadline, interval);
        let elapsed = start.elapsed();
        assert!(outcome.is_none());
        assert!(elapsed >= deadline, "gave up early: {:?}", elapsed);
        // Slack for scheduler jitter on loaded CI hosts.
        assert!(
            elapsed <= deadline + interval + Duration::from_millis(50),
            "gave up late: {:?}",
            elapsed
        );
    }
}
