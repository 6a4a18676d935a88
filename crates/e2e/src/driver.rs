//! The automation driver seam
//!
//! Everything the orchestrator knows about the mail client goes through
//! [`Driver`]. Concrete drivers live in [`crate::webdriver`] (a real browser
//! over the W3C WebDriver protocol) and [`crate::sim`] (an in-memory client).

use std::fmt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

/// Placeholder for the run's label name inside label locators.
pub const LABEL_PLACEHOLDER: &str = "{label}";

/// A locator for an element on the page.
///
/// Serialized as `{ css = "..." }` or `{ xpath = "..." }` in TOML profiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Css(String),
    Xpath(String),
}

impl Selector {
    pub fn css(value: impl Into<String>) -> Self {
        Selector::Css(value.into())
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Selector::Xpath(value.into())
    }

    /// The raw locator expression.
    pub fn value(&self) -> &str {
        match self {
            Selector::Css(v) | Selector::Xpath(v) => v,
        }
    }

    /// Substitute `{label}` in the locator expression.
    pub fn with_label(&self, label: &str) -> Self {
        match self {
            Selector::Css(v) => Selector::Css(v.replace(LABEL_PLACEHOLDER, label)),
            Selector::Xpath(v) => Selector::Xpath(v.replace(LABEL_PLACEHOLDER, label)),
        }
    }

    /// W3C WebDriver location strategy name.
    pub fn strategy(&self) -> &'static str {
        match self {
            Selector::Css(_) => "css selector",
            Selector::Xpath(_) => "xpath",
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(v) => write!(f, "css:{}", v),
            Selector::Xpath(v) => write!(f, "xpath:{}", v),
        }
    }
}

/// Opaque reference to an element owned by the driver session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Capability set the orchestrator needs from a UI-automation backend.
///
/// One driver value is one browser session. It is owned by a single run and
/// closed when that run ends.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Load a page.
    async fn navigate(&self, url: &str) -> DriverResult<()>;

    /// Find the first element matching `selector`, or `NotFound`.
    async fn locate(&self, selector: &Selector) -> DriverResult<ElementHandle>;

    /// Find all matching elements; an empty list is not an error.
    async fn locate_all(&self, selector: &Selector) -> DriverResult<Vec<ElementHandle>>;

    /// Click through the normal interaction path. May fail with `NotInteractable`.
    async fn click(&self, element: &ElementHandle) -> DriverResult<()>;

    /// Type into an element. May fail with `NotInteractable`.
    async fn type_text(&self, element: &ElementHandle, text: &str) -> DriverResult<()>;

    async fn read_text(&self, element: &ElementHandle) -> DriverResult<String>;

    async fn read_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>>;

    /// Click bypassing interactability checks.
    async fn force_click(&self, element: &ElementHandle) -> DriverResult<()>;

    /// End the session. Called exactly once, on every exit path of a run.
    async fn close_session(&self) -> DriverResult<()>;
}
