//! Workflow state machine
//!
//! Runs the round trip as nine dependent steps against one driver session:
//!
//! ```text
//! NotStarted -> Running(0) -> ... -> Running(8) -> Completed
//!                    \                    \
//!                     +--------------------+--> Aborted(index, reason)
//! ```
//!
//! Point interactions go through [`crate::retry`], element waits through
//! [`crate::waiter`], and arrival through [`crate::correlator`]. Verification
//! steps soft-assert: a mismatch is recorded as `Fail` and the run continues.

use std::fmt;
use std::sync::Arc;
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{MessagePayload, ProbeConfig};
use crate::correlator::{Arrival, Baseline, Correlator};
use crate::driver::{Driver, Selector};
use crate::error::{FailureKind, ProbeError, ProbeResult};
use crate::mailbox::Inbox;
use crate::report::RunReport;
use crate::retry::{execute, execute_with_fallback, missing_is_transient, Recovery, RetryPolicy};
use crate::waiter::{wait_for_element, PollPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Login,
    Compose,
    Label,
    Send,
    AwaitArrival,
    Star,
    Open,
    VerifyLabel,
    VerifyContent,
}

impl StepId {
    /// Declared execution order.
    pub const ORDER: [StepId; 9] = [
        StepId::Login,
        StepId::Compose,
        StepId::Label,
        StepId::Send,
        StepId::AwaitArrival,
        StepId::Star,
        StepId::Open,
        StepId::VerifyLabel,
        StepId::VerifyContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Login => "login",
            StepId::Compose => "compose",
            StepId::Label => "label",
            StepId::Send => "send",
            StepId::AwaitArrival => "await_arrival",
            StepId::Star => "star",
            StepId::Open => "open",
            StepId::VerifyLabel => "verify_label",
            StepId::VerifyContent => "verify_content",
        }
    }

    /// 1-based position, as printed in step lines.
    pub fn number(&self) -> usize {
        Self::ORDER.iter().position(|s| s == self).map(|i| i + 1).unwrap_or(0)
    }

    /// Steps whose mismatches are recorded rather than fatal.
    pub fn is_verification(&self) -> bool {
        matches!(self, StepId::VerifyLabel | StepId::VerifyContent)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pass,
    Fail,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pass => "pass",
            StepStatus::Fail => "fail",
            StepStatus::Aborted => "aborted",
        }
    }
}

/// One soft assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

impl Check {
    pub fn compare(name: impl Into<String>, expected: &str, observed: &str) -> Self {
        Self {
            name: name.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
            passed: expected == observed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: StepId,
    pub result: StepStatus,
    pub detail: String,
    /// Failure classification for aborted steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    /// Driver interactions or polls the step needed
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running { step_index: usize },
    Completed,
    Aborted {
        step_index: usize,
        step: StepId,
        reason: String,
        kind: FailureKind,
    },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted { .. })
    }

    /// Steps start in declared order, each only after the previous one settled.
    pub fn can_advance_to(&self, step_index: usize) -> bool {
        match self {
            RunState::NotStarted => step_index == 0,
            RunState::Running { step_index: current } => step_index == current + 1,
            RunState::Completed | RunState::Aborted { .. } => false,
        }
    }
}

/// A named unit of work with an optional resilience policy.
#[derive(Debug)]
pub struct Step {
    pub id: StepId,
    /// `None` for steps that must not be repeated or that poll instead
    pub policy: Option<RetryPolicy>,
    outcome: OnceCell<StepOutcome>,
}

impl Step {
    fn new(id: StepId, policy: Option<RetryPolicy>) -> Self {
        Self {
            id,
            policy,
            outcome: OnceCell::new(),
        }
    }

    /// Record the outcome. Only the first call has any effect.
    pub fn settle(&self, outcome: StepOutcome) -> bool {
        match self.outcome.set(outcome) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(step = %self.id, "outcome already settled; ignoring {:?}", rejected.result);
                false
            }
        }
    }

    pub fn outcome(&self) -> Option<&StepOutcome> {
        self.outcome.get()
    }
}

/// Run-scoped state shared between steps.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub baseline: Option<Baseline>,
    pub arrival: Option<Arrival>,
}

/// The ordered steps of one run plus the state they accumulate.
#[derive(Debug)]
pub struct WorkflowRun {
    pub payload: MessagePayload,
    pub steps: Vec<Step>,
    pub ctx: RunContext,
    pub state: RunState,
}

impl WorkflowRun {
    pub fn new(config: &ProbeConfig) -> Self {
        let base = config.timing.retry_policy();
        // the newest row re-renders right after arrival
        let settling = base.with_classifier(missing_is_transient);

        let steps = StepId::ORDER
            .iter()
            .map(|&id| {
                let policy = match id {
                    StepId::Send | StepId::AwaitArrival => None,
                    StepId::Star | StepId::Open => Some(settling),
                    _ => Some(base),
                };
                Step::new(id, policy)
            })
            .collect();

        Self {
            payload: config.payload(),
            steps,
            ctx: RunContext::default(),
            state: RunState::NotStarted,
        }
    }
}

/// What a step produced when it did not abort.
struct Performed {
    detail: String,
    attempts: u32,
    checks: Vec<Check>,
}

impl Performed {
    fn new(detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            detail: detail.into(),
            attempts,
            checks: Vec::new(),
        }
    }
}

/// Closes the session if a run is dropped before it reaches its own close,
/// e.g. when the caller wraps it in a timeout.
struct CloseOnDrop<D: Driver + 'static> {
    driver: Option<Arc<D>>,
}

impl<D: Driver + 'static> CloseOnDrop<D> {
    fn new(driver: Arc<D>) -> Self {
        Self { driver: Some(driver) }
    }

    fn disarm(&mut self) {
        self.driver = None;
    }
}

impl<D: Driver + 'static> Drop for CloseOnDrop<D> {
    fn drop(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("run dropped before completion; closing driver session");
                handle.spawn(async move {
                    if let Err(e) = driver.close_session().await {
                        warn!("failed to close driver session: {}", e);
                    }
                });
            }
            Err(_) => error!("run dropped outside a runtime; driver session left open"),
        }
    }
}

/// Drives one workflow run over one driver session.
pub struct Orchestrator<D: Driver + 'static> {
    config: ProbeConfig,
    driver: Arc<D>,
    element_poll: PollPolicy,
}

impl<D: Driver + 'static> Orchestrator<D> {
    /// Takes ownership of the session; it is closed when the run ends, or
    /// in the background if the run is dropped first.
    pub fn new(mut config: ProbeConfig, driver: D) -> Self {
        config.selectors = config.selectors.for_label(&config.label);
        let element_poll = config.timing.element_poll();
        Self {
            config,
            driver: Arc::new(driver),
            element_poll,
        }
    }

    /// Execute every step in order and close the session, whatever happens.
    pub async fn run(self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut run = WorkflowRun::new(&self.config);
        let mut guard = CloseOnDrop::new(Arc::clone(&self.driver));

        info!(%run_id, recipient = %run.payload.recipient, subject = %run.payload.subject, "starting run");

        for (index, step) in run.steps.iter().enumerate() {
            if !run.state.can_advance_to(index) {
                break;
            }
            run.state = RunState::Running { step_index: index };

            let policy = step.policy.unwrap_or_default();
            let step_start = Instant::now();
            let result = self.perform(step.id, &policy, &run.payload, &mut run.ctx).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(done) => {
                    let failed = done.checks.iter().any(|c| !c.passed);
                    StepOutcome {
                        step: step.id,
                        result: if failed { StepStatus::Fail } else { StepStatus::Pass },
                        detail: done.detail,
                        kind: None,
                        attempts: done.attempts,
                        duration_ms,
                        checks: done.checks,
                    }
                }
                Err(e) => {
                    let kind = e.kind();
                    run.state = RunState::Aborted {
                        step_index: index,
                        step: step.id,
                        reason: e.to_string(),
                        kind,
                    };
                    StepOutcome {
                        step: step.id,
                        result: StepStatus::Aborted,
                        detail: e.to_string(),
                        kind: Some(kind),
                        attempts: e.attempts().unwrap_or(0),
                        duration_ms,
                        checks: Vec::new(),
                    }
                }
            };

            log_outcome(&outcome);
            step.settle(outcome);
        }

        if !run.state.is_terminal() {
            run.state = RunState::Completed;
        }

        if let Err(e) = self.driver.close_session().await {
            warn!("failed to close driver session: {}", e);
        }
        guard.disarm();

        let report = RunReport {
            run_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            state: run.state,
            payload: run.payload,
            baseline: run.ctx.baseline,
            arrival: run.ctx.arrival,
            steps: run.steps.iter().filter_map(|s| s.outcome().cloned()).collect(),
        };

        match &report.state {
            RunState::Aborted { step, reason, .. } => error!("run aborted at {}: {}", step, reason),
            _ => info!(
                soft_failures = report.soft_failures().len(),
                duration_ms = report.duration_ms,
                "run completed"
            ),
        }

        report
    }

    async fn perform(
        &self,
        step: StepId,
        policy: &RetryPolicy,
        payload: &MessagePayload,
        ctx: &mut RunContext,
    ) -> ProbeResult<Performed> {
        let s = &self.config.selectors;
        match step {
            StepId::Login => {
                self.driver.navigate(&s.login_url).await?;
                let mut attempts = self.type_into(&s.identifier_input, &self.config.account.identity, policy).await?;
                attempts += self.click(&s.identifier_next, policy).await?;
                attempts += self
                    .type_into(&s.password_input, self.config.account.credential.expose(), policy)
                    .await?;
                attempts += self.click(&s.password_next, policy).await?;
                wait_for_element(&*self.driver, &s.inbox_ready, &self.element_poll).await?;

                let baseline = Inbox::new(&*self.driver, s).baseline().await?;
                ctx.baseline = Some(baseline);
                Ok(Performed::new(
                    format!("Logged in successfully! Inbox baseline {}", baseline),
                    attempts,
                ))
            }

            StepId::Compose => {
                let mut attempts = self.click(&s.compose_button, policy).await?;
                attempts += self.type_into(&s.to_input, &payload.recipient, policy).await?;
                attempts += self.type_into(&s.subject_input, &payload.subject, policy).await?;
                attempts += self.type_into(&s.body_input, &payload.body, policy).await?;
                Ok(Performed::new("Mail composed", attempts))
            }

            StepId::Label => {
                let mut attempts = self.click(&s.more_options, policy).await?;
                attempts += self.click(&s.label_menu, policy).await?;
                attempts += self.click(&s.label_option, policy).await?;
                Ok(Performed::new(format!("{} label selected", self.config.label), attempts))
            }

            StepId::Send => {
                let attempts = self.send_once(&s.send_button).await?;
                Ok(Performed::new("Mail sent", attempts))
            }

            StepId::AwaitArrival => {
                let baseline = ctx.baseline.unwrap_or(Baseline::Absent);
                let inbox = Inbox::new(&*self.driver, s);
                let arrival = Correlator::new(&inbox, self.config.timing.arrival_interval())
                    .await_new_event(
                        baseline,
                        &self.config.expected_originator,
                        self.config.timing.arrival_timeout(),
                    )
                    .await?;

                let detail = if arrival.originator_checked {
                    format!("New email arrived from '{}' sender.", arrival.entry.originator)
                } else {
                    format!("New email arrived ({}); originator not checked", arrival.entry)
                };
                let polls = arrival.polls;
                ctx.arrival = Some(arrival);
                Ok(Performed::new(detail, polls))
            }

            StepId::Star => {
                let attempts = self.click(&s.star_toggle, policy).await?;
                Ok(Performed::new("First email marked as starred.", attempts))
            }

            StepId::Open => {
                let attempts = self.click(&s.open_newest, policy).await?;
                wait_for_element(&*self.driver, &s.opened_subject, &self.element_poll).await?;
                Ok(Performed::new("First email opened.", attempts))
            }

            StepId::VerifyLabel => {
                let mut attempts = self.click(&s.message_more_options, policy).await?;
                attempts += self.click(&s.message_label_menu, policy).await?;
                let (checked, reads) = self
                    .read_attribute(&s.message_label_option, &s.label_checked_attribute, policy)
                    .await?;
                attempts += reads;

                let observed = checked.unwrap_or_else(|| "absent".to_string());
                let check = Check::compare(format!("{} label", self.config.label), "true", &observed);
                let detail = if check.passed {
                    format!("{} label verified", self.config.label)
                } else {
                    format!("{} label value {}", self.config.label, observed)
                };
                Ok(Performed {
                    detail,
                    attempts,
                    checks: vec![check],
                })
            }

            StepId::VerifyContent => {
                let (body, mut attempts) = self.read_text(&s.opened_body, policy).await?;
                let (subject, reads) = self.read_text(&s.opened_subject, policy).await?;
                attempts += reads;

                let checks = vec![
                    Check::compare("body", &payload.body, &body),
                    Check::compare("subject", &payload.subject, &subject),
                ];
                let passed = checks.iter().filter(|c| c.passed).count();
                let detail = format!("{}/{} content checks passed", passed, checks.len());
                Ok(Performed {
                    detail,
                    attempts,
                    checks,
                })
            }
        }
    }

    /// Wait for `selector`, then click it. A transient failure falls back to a
    /// script click, which completes the action.
    async fn click(&self, selector: &Selector, policy: &RetryPolicy) -> ProbeResult<u32> {
        let driver = &*self.driver;
        wait_for_element(driver, selector, &self.element_poll).await?;

        let done = execute_with_fallback(
            policy,
            &format!("click {}", selector),
            || async move {
                let el = driver.locate(selector).await?;
                driver.click(&el).await
            },
            |_| async move {
                let el = driver.locate(selector).await?;
                driver.force_click(&el).await?;
                Ok(Recovery::Resolved(()))
            },
        )
        .await?;
        Ok(done.attempts)
    }

    /// Wait for `selector`, then type into it. A transient failure focuses the
    /// field with a script click and types again.
    async fn type_into(&self, selector: &Selector, text: &str, policy: &RetryPolicy) -> ProbeResult<u32> {
        let driver = &*self.driver;
        wait_for_element(driver, selector, &self.element_poll).await?;

        let done = execute_with_fallback(
            policy,
            &format!("type into {}", selector),
            || async move {
                let el = driver.locate(selector).await?;
                driver.type_text(&el, text).await
            },
            |_| async move {
                let el = driver.locate(selector).await?;
                driver.force_click(&el).await?;
                Ok(Recovery::Retry)
            },
        )
        .await?;
        Ok(done.attempts)
    }

    async fn read_text(&self, selector: &Selector, policy: &RetryPolicy) -> ProbeResult<(String, u32)> {
        let driver = &*self.driver;
        wait_for_element(driver, selector, &self.element_poll).await?;

        let done = execute(policy, &format!("read {}", selector), || async move {
            let el = driver.locate(selector).await?;
            driver.read_text(&el).await
        })
        .await?;
        Ok((done.value.trim().to_string(), done.attempts))
    }

    async fn read_attribute(
        &self,
        selector: &Selector,
        name: &str,
        policy: &RetryPolicy,
    ) -> ProbeResult<(Option<String>, u32)> {
        let driver = &*self.driver;
        wait_for_element(driver, selector, &self.element_poll).await?;

        let done = execute(policy, &format!("read {}@{}", selector, name), || async move {
            let el = driver.locate(selector).await?;
            driver.read_attribute(&el, name).await
        })
        .await?;
        Ok((done.value, done.attempts))
    }

    /// Activate send exactly once. A click that was refused as not
    /// interactable never reached the page, so one script click may follow;
    /// nothing else is repeated.
    async fn send_once(&self, selector: &Selector) -> ProbeResult<u32> {
        let el = wait_for_element(&*self.driver, selector, &self.element_poll).await?;
        match self.driver.click(&el).await {
            Ok(()) => Ok(1),
            Err(e) if crate::retry::default_classify(&e) == FailureKind::Transient => {
                warn!("send click refused ({}); using script click", e);
                let el = self.driver.locate(selector).await?;
                self.driver.force_click(&el).await?;
                Ok(2)
            }
            Err(e) => Err(ProbeError::Driver(e)),
        }
    }
}

fn log_outcome(outcome: &StepOutcome) {
    let n = outcome.step.number();
    let id = outcome.step;
    match outcome.result {
        StepStatus::Pass => info!("Step {} ({}): Pass! {}", n, id, outcome.detail),
        StepStatus::Fail => {
            for check in outcome.checks.iter().filter(|c| !c.passed) {
                debug!(check = %check.name, expected = %check.expected, observed = %check.observed, "soft assertion failed");
            }
            warn!("Step {} ({}): Fail! {}", n, id, outcome.detail)
        }
        StepStatus::Aborted => error!("Step {} ({}): Aborted! {}", n, id, outcome.detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_numbers_follow_declared_order() {
        assert_eq!(StepId::Login.number(), 1);
        assert_eq!(StepId::AwaitArrival.number(), 5);
        assert_eq!(StepId::VerifyContent.number(), 9);
        assert!(StepId::VerifyLabel.is_verification());
        assert!(!StepId::Send.is_verification());
    }

    #[test]
    fn test_run_state_transitions() {
        let state = RunState::NotStarted;
        assert!(state.can_advance_to(0));
        assert!(!state.can_advance_to(1));

        let state = RunState::Running { step_index: 3 };
        assert!(state.can_advance_to(4));
        assert!(!state.can_advance_to(3));
        assert!(!state.can_advance_to(5));

        assert!(!RunState::Completed.can_advance_to(0));
        assert!(RunState::Completed.is_terminal());
    }

    #[test]
    fn test_outcome_settles_once() {
        let step = Step::new(StepId::Login, None);
        let outcome = |result| StepOutcome {
            step: StepId::Login,
            result,
            detail: String::new(),
            kind: None,
            attempts: 1,
            duration_ms: 0,
            checks: Vec::new(),
        };

        assert!(step.settle(outcome(StepStatus::Pass)));
        assert!(!step.settle(outcome(StepStatus::Aborted)));
        assert_eq!(step.outcome().map(|o| o.result), Some(StepStatus::Pass));
    }

    #[test]
    fn test_send_and_arrival_are_not_wrapped() {
        let run = WorkflowRun::new(&ProbeConfig::default());
        let policy_of = |id| run.steps.iter().find(|s| s.id == id).and_then(|s| s.policy);

        assert!(policy_of(StepId::Send).is_none());
        assert!(policy_of(StepId::AwaitArrival).is_none());
        assert_eq!(policy_of(StepId::Compose).map(|p| p.max_attempts), Some(3));
        assert_eq!(run.steps.len(), 9);
        assert_eq!(run.state, RunState::NotStarted);
    }

    #[test]
    fn test_check_compare() {
        assert!(Check::compare("body", "Test Email Body", "Test Email Body").passed);
        assert!(!Check::compare("body", "Test Email Body", "other").passed);
    }
}
