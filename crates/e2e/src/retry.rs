//! Resilient operation wrapper
//!
//! Bounded retry for point interactions (click, type, read). Only wrap actions
//! whose repetition cannot duplicate an externally visible effect; sending a
//! message is attempted once, outside this loop.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{DriverError, FailureKind, ProbeError, ProbeResult};

/// Decides whether a driver failure is worth another attempt.
pub type Classifier = fn(&DriverError) -> FailureKind;

/// Default classification: interactability and staleness are transient,
/// everything else (absent element, broken markup, dead session) is structural.
pub fn default_classify(error: &DriverError) -> FailureKind {
    match error {
        DriverError::NotInteractable(_) | DriverError::Stale(_) => FailureKind::Transient,
        DriverError::NotFound(_)
        | DriverError::Malformed(_)
        | DriverError::Session(_)
        | DriverError::Transport(_) => FailureKind::Structural,
    }
}

/// Like [`default_classify`], but an element that has not rendered yet is
/// also retried. Used right after navigation, where the page is still settling.
pub fn missing_is_transient(error: &DriverError) -> FailureKind {
    match error {
        DriverError::NotFound(_) => FailureKind::Transient,
        other => default_classify(other),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Upper bound on action invocations; values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Pause before running the fallback.
    pub fallback_delay: Duration,
    pub classify: Classifier,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, fallback_delay: Duration) -> Self {
        Self {
            max_attempts,
            fallback_delay,
            classify: default_classify,
        }
    }

    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// What a fallback achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery<T> {
    /// The fallback prepared the ground; invoke the action again.
    Retry,
    /// The fallback performed the effect itself; do not invoke the action again.
    Resolved(T),
}

/// Successful result of [`execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    /// Number of times the action itself was invoked.
    pub attempts: u32,
    /// Number of times the fallback ran.
    pub fallbacks: u32,
}

/// Run `action` under `policy` without a fallback.
pub async fn execute<T, A, AFut>(policy: &RetryPolicy, what: &str, action: A) -> ProbeResult<Attempted<T>>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = Result<T, DriverError>>,
{
    execute_with_fallback(policy, what, action, |_| async { Ok(Recovery::Retry) }).await
}

/// Run `action` under `policy`, invoking `fallback` between attempts.
///
/// A structural failure from the action is returned immediately. A transient
/// one triggers the fallback and another attempt while attempts remain;
/// otherwise [`ProbeError::RetriesExhausted`]. A transient failure of the
/// fallback itself is logged and the next attempt proceeds; a structural one
/// aborts.
pub async fn execute_with_fallback<T, A, AFut, B, BFut>(
    policy: &RetryPolicy,
    what: &str,
    mut action: A,
    mut fallback: B,
) -> ProbeResult<Attempted<T>>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = Result<T, DriverError>>,
    B: FnMut(DriverError) -> BFut,
    BFut: Future<Output = Result<Recovery<T>, DriverError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;
    let mut fallbacks = 0u32;

    loop {
        attempts += 1;

        let error = match action().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(what, attempts, "succeeded after retry");
                }
                return Ok(Attempted {
                    value,
                    attempts,
                    fallbacks,
                });
            }
            Err(e) => e,
        };

        match (policy.classify)(&error) {
            FailureKind::Transient => {}
            kind => {
                debug!(what, attempts, kind = kind.as_str(), "not retrying: {}", error);
                return Err(ProbeError::Driver(error));
            }
        }

        if attempts >= max_attempts {
            warn!(what, attempts, "retries exhausted: {}", error);
            return Err(ProbeError::RetriesExhausted {
                attempts,
                last: error,
            });
        }

        warn!(what, attempts, "transient failure, running fallback: {}", error);

        if !policy.fallback_delay.is_zero() {
            sleep(policy.fallback_delay).await;
        }

        fallbacks += 1;
        match fallback(error).await {
            Ok(Recovery::Retry) => {}
            Ok(Recovery::Resolved(value)) => {
                debug!(what, attempts, "fallback completed the action");
                return Ok(Attempted {
                    value,
                    attempts,
                    fallbacks,
                });
            }
            Err(e) if (policy.classify)(&e) == FailureKind::Transient => {
                warn!(what, attempts, "fallback failed, retrying anyway: {}", e);
            }
            Err(e) => return Err(ProbeError::Driver(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use parking_lot::Mutex;

    fn not_interactable() -> DriverError {
        DriverError::NotInteractable("send button obscured".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_twice_then_pass() {
        let calls = AtomicU32::new(0);
        let events = Mutex::new(Vec::new());
        let policy = RetryPolicy::new(3, Duration::from_millis(50));

        let result = execute_with_fallback(
            &policy,
            "click",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                events.lock().push(format!("attempt {}", n));
                async move {
                    if n < 3 {
                        Err(not_interactable())
                    } else {
                        Ok("clicked")
                    }
                }
            },
            |_| {
                events.lock().push("fallback".to_string());
                async { Ok(Recovery::Retry) }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, "clicked");
        assert_eq!(result.attempts, 3);
        assert_eq!(result.fallbacks, 2);
        assert_eq!(
            *events.lock(),
            vec!["attempt 1", "fallback", "attempt 2", "fallback", "attempt 3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let err = execute(&policy, "locate", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DriverError::NotFound("#send".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), FailureKind::Structural);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let err = execute(&policy, "type", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(not_interactable()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ProbeError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, not_interactable());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolving_fallback_stops_invocations() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result = execute_with_fallback(
            &policy,
            "click compose",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(not_interactable()) }
            },
            |_| async { Ok(Recovery::Resolved(())) },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_invokes_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::ZERO);

        let err = execute(&policy, "click", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(not_interactable()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ProbeError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_fallback_failure_aborts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let err = execute_with_fallback(
            &policy,
            "click",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(not_interactable()) }
            },
            |_| async { Err(DriverError::Session("browser gone".into())) },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ProbeError::Driver(DriverError::Session(_))));
    }

    #[test]
    fn test_classifiers() {
        let missing = DriverError::NotFound("#x".into());
        assert_eq!(default_classify(&missing), FailureKind::Structural);
        assert_eq!(missing_is_transient(&missing), FailureKind::Transient);
        assert_eq!(
            missing_is_transient(&DriverError::Malformed("x".into())),
            FailureKind::Structural
        );
    }
}
