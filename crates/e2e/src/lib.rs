//! inbox-probe: round-trip checks for web mail clients
//!
//! Signs in, sends a labelled message to the same account, waits for it to
//! arrive, and verifies the received copy. The mail client is reached through
//! a [`Driver`]: a real browser over W3C WebDriver, or an in-memory simulation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Orchestrator (workflow.rs)                  │
//! │    login -> compose -> label -> send -> await_arrival ->    │
//! │    star -> open -> verify_label -> verify_content           │
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │  retry.rs     │  waiter.rs       │  correlator.rs           │
//! │  execute()    │  poll()          │  await_new_event()       │
//! │  fallbacks    │  wait_until()    │  Baseline, Arrival       │
//! ├───────────────┴──────────────────┴──────────────────────────┤
//! │  mailbox.rs: Inbox (EventSource over a SelectorProfile)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Driver (driver.rs)                                         │
//! │    ├── WebDriverSession (webdriver.rs)                      │
//! │    └── SimSession       (sim.rs)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod correlator;
pub mod driver;
pub mod error;
pub mod mailbox;
pub mod report;
pub mod retry;
pub mod sim;
pub mod waiter;
pub mod webdriver;
pub mod workflow;

pub use config::{ProbeConfig, SelectorProfile};
pub use correlator::{Arrival, Baseline, Correlator, EventSource, MailboxEntry};
pub use driver::{Driver, ElementHandle, Selector};
pub use error::{DriverError, DriverResult, FailureKind, ProbeError, ProbeResult};
pub use report::RunReport;
pub use retry::{execute, execute_with_fallback, Recovery, RetryPolicy};
pub use waiter::{poll, wait_until, PollPolicy, Signal};
pub use workflow::{Orchestrator, RunState, StepId, StepStatus};
