//! Condition waiter
//!
//! Polls a probe against the driver on a fixed cadence until it yields a value
//! or the deadline passes. Waiting happens on the calling task; nothing is
//! spawned.

use std::future::Future;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::driver::{Driver, ElementHandle, Selector};
use crate::error::{DriverError, DriverResult, ProbeError, ProbeResult};

/// Timeout and cadence for a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            // a zero interval would spin the executor
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

/// Result of a poll loop. Timing out is a value, not an error.
#[derive(Debug, Clone)]
pub enum Signal<T = ()> {
    Ready {
        value: T,
        elapsed: Duration,
        polls: u32,
    },
    TimedOut {
        elapsed: Duration,
        polls: u32,
        /// Most recent lookup miss, if the probe kept failing to find its target.
        last_miss: Option<DriverError>,
    },
}

impl<T> Signal<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Signal::Ready { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Signal::TimedOut { .. })
    }

    pub fn polls(&self) -> u32 {
        match self {
            Signal::Ready { polls, .. } | Signal::TimedOut { polls, .. } => *polls,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Signal::Ready { elapsed, .. } | Signal::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    /// Turn a timeout into [`ProbeError::Timeout`] for callers that treat it as fatal.
    pub fn into_ready(self, what: &str) -> ProbeResult<T> {
        match self {
            Signal::Ready { value, .. } => Ok(value),
            Signal::TimedOut { elapsed, .. } => Err(ProbeError::Timeout {
                what: what.to_string(),
                elapsed,
            }),
        }
    }
}

/// Poll `probe` until it returns `Some`, or until `policy.timeout` elapses.
///
/// The probe runs immediately, then every `policy.interval`; the last sleep is
/// clamped to the deadline so the loop never overshoots by more than one
/// interval. Lookup misses (absent, stale, not yet interactable) count as
/// "not yet" for that tick. Any other driver error is structural and is
/// returned at once.
pub async fn poll<T, F, Fut>(policy: &PollPolicy, what: &str, mut probe: F) -> DriverResult<Signal<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriverResult<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut polls = 0u32;
    let mut last_miss: Option<DriverError> = None;

    loop {
        polls += 1;

        match probe().await {
            Ok(Some(value)) => {
                let elapsed = start.elapsed();
                debug!(what, polls, elapsed_ms = elapsed.as_millis() as u64, "condition ready");
                return Ok(Signal::Ready { value, elapsed, polls });
            }
            Ok(None) => {}
            Err(e) if e.is_lookup_miss() => {
                trace!(what, polls, "lookup miss: {}", e);
                last_miss = Some(e);
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            let elapsed = start.elapsed();
            debug!(what, polls, elapsed_ms = elapsed.as_millis() as u64, "condition timed out");
            return Ok(Signal::TimedOut {
                elapsed,
                polls,
                last_miss,
            });
        }

        sleep(policy.interval.min(deadline - now)).await;
    }
}

/// Boolean form of [`poll`].
pub async fn wait_until<F, Fut>(policy: &PollPolicy, what: &str, mut predicate: F) -> DriverResult<Signal>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DriverResult<bool>>,
{
    poll(policy, what, || {
        let fut = predicate();
        async move { fut.await.map(|ok| ok.then_some(())) }
    })
    .await
}

/// Wait for an element to be present and return its handle.
pub async fn wait_for_element<D: Driver + ?Sized>(
    driver: &D,
    selector: &Selector,
    policy: &PollPolicy,
) -> ProbeResult<ElementHandle> {
    let what = selector.to_string();
    let signal = poll(policy, &what, || async move { driver.locate(selector).await.map(Some) }).await?;
    signal.into_ready(&what)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_kth_evaluation() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(secs(10), secs(1));

        let signal = wait_until(&policy, "k=4", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n >= 4) }
        })
        .await
        .unwrap();

        assert!(signal.is_ready());
        assert_eq!(signal.polls(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(signal.elapsed(), secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_sleep() {
        let policy = PollPolicy::new(secs(10), secs(1));
        let signal = wait_until(&policy, "now", || async { Ok(true) }).await.unwrap();
        assert_eq!(signal.polls(), 1);
        assert_eq!(signal.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_clamped_to_deadline() {
        let policy = PollPolicy::new(Duration::from_millis(2500), secs(1));
        let signal = wait_until(&policy, "never", || async { Ok(false) }).await.unwrap();

        assert!(signal.is_timed_out());
        // evaluations at 0s, 1s, 2s, 2.5s
        assert_eq!(signal.polls(), 4);
        assert_eq!(signal.elapsed(), Duration::from_millis(2500));
        assert!(signal.elapsed() <= policy.timeout + policy.interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_misses_are_absorbed() {
        let policy = PollPolicy::new(secs(3), secs(1));
        let signal = wait_until(&policy, "missing", || async {
            Err(DriverError::NotFound("#inbox".into()))
        })
        .await
        .unwrap();

        match signal {
            Signal::TimedOut { polls, last_miss, .. } => {
                assert_eq!(polls, 4);
                assert_eq!(last_miss, Some(DriverError::NotFound("#inbox".into())));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(secs(30), secs(1));
        let start = Instant::now();

        let result = wait_until(&policy, "broken", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DriverError::Malformed("row without cells".into())) }
        })
        .await;

        assert!(matches!(result, Err(DriverError::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(secs(10), Duration::from_millis(500));

        let signal = poll(&policy, "late element", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(DriverError::NotFound("#late".into()))
                } else {
                    Ok(Some(n))
                }
            }
        })
        .await
        .unwrap();

        match signal {
            Signal::Ready { value, polls, elapsed } => {
                assert_eq!(value, 3);
                assert_eq!(polls, 3);
                assert_eq!(elapsed, secs(1));
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_into_ready_maps_timeout() {
        let signal: Signal<()> = Signal::TimedOut {
            elapsed: secs(10),
            polls: 11,
            last_miss: None,
        };
        let err = signal.into_ready("css:#compose").unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert!(err.to_string().contains("css:#compose"));
    }
}
