//! Event correlator
//!
//! Waits for the inbox count to rise above a baseline and checks that the new
//! entry came from whoever the run expects. A count increase on its own only
//! says *something* arrived; unrelated mail landing mid-run must not pass as
//! the message the run sent.

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DriverResult, ProbeError, ProbeResult};
use crate::waiter::{poll, PollPolicy, Signal};

/// Inbox size observed before the run caused a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "count", rename_all = "snake_case")]
pub enum Baseline {
    Observed(usize),
    /// The inbox could not be read before sending. Any entry counts as new and
    /// the first observation is accepted without an originator check.
    Absent,
}

impl Baseline {
    /// The count that must be strictly exceeded.
    pub fn threshold(&self) -> usize {
        match self {
            Baseline::Observed(n) => *n,
            Baseline::Absent => 0,
        }
    }
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Baseline::Observed(n) => write!(f, "{}", n),
            Baseline::Absent => f.write_str("absent"),
        }
    }
}

/// One inbox entry as read from the page. Never cached; every poll reads anew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub originator: String,
    pub subject: String,
    /// Timestamp label as the client renders it, when available
    pub timestamp: Option<String>,
}

impl fmt::Display for MailboxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "originator: {}, subject: {}", self.originator, self.subject)?;
        if let Some(ts) = &self.timestamp {
            write!(f, ", time: {}", ts)?;
        }
        Ok(())
    }
}

/// A source of countable external events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Current number of events.
    async fn count(&self) -> DriverResult<usize>;

    /// The most recent event, if any.
    async fn newest(&self) -> DriverResult<Option<MailboxEntry>>;
}

/// A correlated arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrival {
    pub entry: MailboxEntry,
    pub count: usize,
    pub baseline: Baseline,
    pub elapsed_ms: u64,
    pub polls: u32,
    /// False when the baseline was absent and the check was skipped
    pub originator_checked: bool,
}

pub struct Correlator<'a, S: EventSource + ?Sized> {
    source: &'a S,
    interval: Duration,
}

impl<'a, S: EventSource + ?Sized> Correlator<'a, S> {
    pub fn new(source: &'a S, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Wait for an event beyond `baseline` and validate its originator.
    ///
    /// Errors are kept apart so callers can tell "never arrived"
    /// ([`ProbeError::ArrivalTimeout`]) from "arrived from the wrong origin"
    /// ([`ProbeError::Correlation`]).
    pub async fn await_new_event(
        &self,
        baseline: Baseline,
        expected_originator: &str,
        timeout: Duration,
    ) -> ProbeResult<Arrival> {
        let policy = PollPolicy::new(timeout, self.interval);
        let threshold = baseline.threshold();
        let source = self.source;

        info!(%baseline, timeout_ms = timeout.as_millis() as u64, "waiting for new mail");

        // Count and newest entry are read in one probe, so a row that
        // re-renders right after arrival is just another tick.
        let signal = poll(&policy, "new inbox entry", || async move {
            let count = source.count().await?;
            if count <= threshold {
                return Ok(None);
            }
            match source.newest().await? {
                Some(entry) => Ok(Some((count, entry))),
                None => {
                    debug!(count, "inbox count rose but the newest entry is not readable yet");
                    Ok(None)
                }
            }
        })
        .await?;

        let (count, entry, elapsed, polls) = match signal {
            Signal::Ready { value: (count, entry), elapsed, polls } => (count, entry, elapsed, polls),
            Signal::TimedOut { elapsed, .. } => {
                return Err(ProbeError::ArrivalTimeout { elapsed, baseline });
            }
        };

        let originator_checked = match baseline {
            Baseline::Observed(_) => {
                if entry.originator.trim() != expected_originator.trim() {
                    warn!(expected = expected_originator, observed = %entry.originator, "originator mismatch");
                    return Err(ProbeError::Correlation {
                        expected: expected_originator.to_string(),
                        observed: entry.originator,
                        subject: entry.subject,
                    });
                }
                true
            }
            Baseline::Absent => {
                warn!("no baseline was observed; accepting first entry without originator check");
                false
            }
        };

        info!(count, elapsed_ms = elapsed.as_millis() as u64, "new mail arrived: {}", entry);

        Ok(Arrival {
            entry,
            count,
            baseline,
            elapsed_ms: elapsed.as_millis() as u64,
            polls,
            originator_checked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use parking_lot::Mutex;

    /// Inbox whose contents are fixed.
    struct StaticInbox {
        entries: Mutex<Vec<MailboxEntry>>,
    }

    impl StaticInbox {
        fn with(originators: &[&str]) -> Self {
            let entries = originators
                .iter()
                .map(|o| MailboxEntry {
                    originator: o.to_string(),
                    subject: "Test Email Subject".into(),
                    timestamp: None,
                })
                .collect();
            Self {
                entries: Mutex::new(entries),
            }
        }
    }

    #[async_trait]
    impl EventSource for StaticInbox {
        async fn count(&self) -> DriverResult<usize> {
            Ok(self.entries.lock().len())
        }

        async fn newest(&self) -> DriverResult<Option<MailboxEntry>> {
            Ok(self.entries.lock().first().cloned())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_above_baseline_with_matching_originator() {
        let inbox = StaticInbox::with(&["me", "alice", "bob", "carol"]);
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let arrival = correlator
            .await_new_event(Baseline::Observed(3), "me", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(arrival.count, 4);
        assert_eq!(arrival.entry.originator, "me");
        assert!(arrival.originator_checked);
        assert_eq!(arrival.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_above_baseline_with_wrong_originator() {
        let inbox = StaticInbox::with(&["someone-else", "alice", "bob", "carol"]);
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let err = correlator
            .await_new_event(Baseline::Observed(3), "me", Duration::from_secs(30))
            .await
            .unwrap_err();

        match err {
            ProbeError::Correlation { expected, observed, .. } => {
                assert_eq!(expected, "me");
                assert_eq!(observed, "someone-else");
            }
            other => panic!("expected correlation error, got {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_count_is_not_progress() {
        let inbox = StaticInbox::with(&["me", "alice", "bob"]);
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let err = correlator
            .await_new_event(Baseline::Observed(3), "me", Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            ProbeError::ArrivalTimeout { elapsed, baseline } => {
                assert_eq!(elapsed, Duration::from_secs(5));
                assert_eq!(baseline, Baseline::Observed(3));
            }
            other => panic!("expected arrival timeout, got {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_baseline_skips_originator_check() {
        let inbox = StaticInbox::with(&["someone-else"]);
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let arrival = correlator
            .await_new_event(Baseline::Absent, "me", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!arrival.originator_checked);
        assert_eq!(arrival.entry.originator, "someone-else");
    }

    /// Inbox holding one entry whose row goes stale on the first read.
    struct RerenderingInbox {
        stale_reads: Mutex<u32>,
        newest_calls: Mutex<u32>,
    }

    #[async_trait]
    impl EventSource for RerenderingInbox {
        async fn count(&self) -> DriverResult<usize> {
            Ok(1)
        }

        async fn newest(&self) -> DriverResult<Option<MailboxEntry>> {
            *self.newest_calls.lock() += 1;
            let mut stale = self.stale_reads.lock();
            if *stale > 0 {
                *stale -= 1;
                return Err(DriverError::Stale("row re-rendered".into()));
            }
            Ok(Some(MailboxEntry {
                originator: "me".into(),
                subject: "Test Email Subject".into(),
                timestamp: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_newest_row_is_read_again() {
        let inbox = RerenderingInbox {
            stale_reads: Mutex::new(1),
            newest_calls: Mutex::new(0),
        };
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let arrival = correlator
            .await_new_event(Baseline::Observed(0), "me", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(arrival.entry.originator, "me");
        assert_eq!(arrival.count, 1);
        assert_eq!(arrival.polls, 2);
        assert_eq!(arrival.elapsed_ms, 1_000);
        assert_eq!(*inbox.newest_calls.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_row_never_readable_times_out() {
        let inbox = RerenderingInbox {
            stale_reads: Mutex::new(u32::MAX),
            newest_calls: Mutex::new(0),
        };
        let correlator = Correlator::new(&inbox, Duration::from_secs(1));

        let err = correlator
            .await_new_event(Baseline::Observed(0), "me", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::ArrivalTimeout { .. }), "{}", err);
    }

    #[test]
    fn test_baseline_display_and_serde() {
        assert_eq!(Baseline::Observed(4).to_string(), "4");
        assert_eq!(Baseline::Absent.to_string(), "absent");
        let json = serde_json::to_string(&Baseline::Observed(2)).unwrap();
        assert_eq!(json, r#"{"state":"observed","count":2}"#);
    }
}
