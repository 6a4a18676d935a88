//! Run configuration
//!
//! Everything a run needs is collected here once and passed to the
//! orchestrator by value. Loaded from TOML; the binary overlays CLI flags.

use std::fmt;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::driver::{Selector, LABEL_PLACEHOLDER};
use crate::error::{ProbeError, ProbeResult};
use crate::retry::RetryPolicy;
use crate::waiter::PollPolicy;

/// Top-level configuration for one probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub message: MessageConfig,

    /// Label applied while composing and verified on the received copy
    #[serde(default = "default_label")]
    pub label: String,

    /// Originator text the mail client shows for mail sent to oneself
    #[serde(default = "default_originator")]
    pub expected_originator: String,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub webdriver: WebDriverConfig,

    #[serde(default = "SelectorProfile::data_attributes")]
    pub selectors: SelectorProfile,
}

fn default_label() -> String {
    "Social".to_string()
}

fn default_originator() -> String {
    "me".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            account: AccountConfig::default(),
            message: MessageConfig::default(),
            label: default_label(),
            expected_originator: default_originator(),
            timing: TimingConfig::default(),
            webdriver: WebDriverConfig::default(),
            selectors: SelectorProfile::data_attributes(),
        }
    }
}

impl ProbeConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> ProbeResult<Self> {
        toml::from_str(content).map_err(ProbeError::from)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> ProbeResult<Self> {
        serde_yaml::from_str(content).map_err(ProbeError::from)
    }

    /// Load configuration from a file; `.yaml`/`.yml` is YAML, anything else TOML
    pub fn load(path: &Path) -> ProbeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if is_yaml {
            Self::from_yaml(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> ProbeResult<()> {
        if self.account.identity.trim().is_empty() {
            return Err(ProbeError::InvalidConfig("account identity (email) is required".into()));
        }
        if self.account.credential.is_empty() {
            return Err(ProbeError::InvalidConfig("account credential is required".into()));
        }
        if self.message.subject.trim().is_empty() {
            return Err(ProbeError::InvalidConfig("message subject must not be empty".into()));
        }
        if self.label.trim().is_empty() {
            return Err(ProbeError::InvalidConfig("label must not be empty".into()));
        }
        if self.expected_originator.trim().is_empty() {
            return Err(ProbeError::InvalidConfig("expected_originator must not be empty".into()));
        }
        let t = &self.timing;
        if t.element_timeout_ms == 0 || t.arrival_timeout_ms == 0 {
            return Err(ProbeError::InvalidConfig("timeouts must be greater than zero".into()));
        }
        if t.arrival_interval_ms > t.arrival_timeout_ms {
            return Err(ProbeError::InvalidConfig(
                "arrival_interval_ms must not exceed arrival_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    /// The message this run sends, with the recipient defaulted to the account.
    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            recipient: self
                .message
                .recipient
                .clone()
                .unwrap_or_else(|| self.account.identity.clone()),
            subject: self.message.subject.clone(),
            body: self.message.body.clone(),
        }
    }
}

/// A secret that never shows up in logs or serialized output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Sign-in identity, usually the email address
    #[serde(default)]
    pub identity: String,

    #[serde(default, skip_serializing)]
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Defaults to the account identity (send to oneself)
    #[serde(default)]
    pub recipient: Option<String>,

    #[serde(default = "default_subject")]
    pub subject: String,

    #[serde(default = "default_body")]
    pub body: String,
}

fn default_subject() -> String {
    "Test Email Subject".to_string()
}

fn default_body() -> String {
    "Test Email Body".to_string()
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            subject: default_subject(),
            body: default_body(),
        }
    }
}

/// Resolved message identity for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Timeouts, cadences and retry bounds, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for an element to appear
    pub element_timeout_ms: u64,
    /// Poll cadence for element waits
    pub poll_interval_ms: u64,
    /// How long to wait for the sent message to arrive
    pub arrival_timeout_ms: u64,
    /// Poll cadence while waiting for arrival
    pub arrival_interval_ms: u64,
    /// Attempts for point interactions
    pub retry_attempts: u32,
    /// Pause before a fallback interaction
    pub fallback_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            element_timeout_ms: 10_000,
            poll_interval_ms: 250,
            arrival_timeout_ms: 30_000,
            arrival_interval_ms: 1_000,
            retry_attempts: 3,
            fallback_delay_ms: 200,
        }
    }
}

impl TimingConfig {
    pub fn element_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.element_timeout_ms),
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    pub fn arrival_timeout(&self) -> Duration {
        Duration::from_millis(self.arrival_timeout_ms)
    }

    pub fn arrival_interval(&self) -> Duration {
        Duration::from_millis(self.arrival_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.fallback_delay_ms))
    }
}

/// Browser driven through WebDriver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Firefox,
    Chrome,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Firefox => "firefox",
            Browser::Chrome => "chrome",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// Address of geckodriver / chromedriver
    pub url: String,
    pub browser: Browser,
    pub headless: bool,
    /// Per-request HTTP timeout
    pub request_timeout_ms: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4444".to_string(),
            browser: Browser::Firefox,
            headless: true,
            request_timeout_ms: 30_000,
        }
    }
}

/// Locators for every control the workflow touches.
///
/// Markup differs per mail client, so these are data. The built-in profile
/// targets `data-probe` attributes, which the simulated client renders.
/// Locators left out of a `[selectors]` table keep their built-in value.
/// `{label}` in the two label option locators stands for the run's label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorProfile {
    pub login_url: String,

    // sign-in
    pub identifier_input: Selector,
    pub identifier_next: Selector,
    pub password_input: Selector,
    pub password_next: Selector,
    /// Present once the inbox has loaded
    pub inbox_ready: Selector,

    // compose
    pub compose_button: Selector,
    pub to_input: Selector,
    pub subject_input: Selector,
    pub body_input: Selector,
    pub more_options: Selector,
    pub label_menu: Selector,
    pub label_option: Selector,
    pub send_button: Selector,

    // inbox list
    /// Container of the row list; when configured and absent, the inbox is
    /// treated as not rendered rather than empty
    #[serde(default)]
    pub inbox_list: Option<Selector>,
    pub inbox_rows: Selector,
    #[serde(default)]
    pub empty_inbox_marker: Option<Selector>,
    #[serde(default = "default_empty_text")]
    pub empty_inbox_text: String,
    pub newest_originator: Selector,
    pub newest_subject: Selector,
    #[serde(default)]
    pub newest_timestamp: Option<Selector>,
    #[serde(default = "default_timestamp_attribute")]
    pub timestamp_attribute: String,
    pub star_toggle: Selector,
    pub open_newest: Selector,

    // opened message
    pub message_more_options: Selector,
    pub message_label_menu: Selector,
    pub message_label_option: Selector,
    #[serde(default = "default_checked_attribute")]
    pub label_checked_attribute: String,
    pub opened_subject: Selector,
    pub opened_body: Selector,
}

fn default_empty_text() -> String {
    "No new mail!".to_string()
}

fn default_timestamp_attribute() -> String {
    "title".to_string()
}

fn default_checked_attribute() -> String {
    "aria-checked".to_string()
}

impl Default for SelectorProfile {
    fn default() -> Self {
        Self::data_attributes()
    }
}

impl SelectorProfile {
    /// Profile keyed on `[data-probe="..."]` attributes.
    pub fn data_attributes() -> Self {
        let p = |name: &str| Selector::css(format!("[data-probe=\"{}\"]", name));
        let labelled = |name: &str| {
            Selector::css(format!("[data-probe=\"{}\"][data-label=\"{}\"]", name, LABEL_PLACEHOLDER))
        };
        Self {
            login_url: "http://127.0.0.1:8080/login".to_string(),
            identifier_input: p("identifier"),
            identifier_next: p("identifier-next"),
            password_input: p("password"),
            password_next: p("password-next"),
            inbox_ready: p("inbox-ready"),
            compose_button: p("compose"),
            to_input: p("to"),
            subject_input: p("subject"),
            body_input: p("body"),
            more_options: p("more-options"),
            label_menu: p("label-menu"),
            label_option: labelled("label-option"),
            send_button: p("send"),
            inbox_list: Some(p("inbox")),
            inbox_rows: p("inbox-row"),
            empty_inbox_marker: Some(p("inbox-empty")),
            empty_inbox_text: default_empty_text(),
            newest_originator: p("newest-originator"),
            newest_subject: p("newest-subject"),
            newest_timestamp: Some(p("newest-time")),
            timestamp_attribute: default_timestamp_attribute(),
            star_toggle: p("newest-star"),
            open_newest: p("newest-open"),
            message_more_options: p("message-more-options"),
            message_label_menu: p("message-label-menu"),
            message_label_option: labelled("message-label-option"),
            label_checked_attribute: default_checked_attribute(),
            opened_subject: p("opened-subject"),
            opened_body: p("opened-body"),
        }
    }

    /// This profile with `label` substituted into the label option locators.
    pub fn for_label(&self, label: &str) -> Self {
        Self {
            label_option: self.label_option.with_label(label),
            message_label_option: self.message_label_option.with_label(label),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = ProbeConfig::from_toml(
            r#"
[account]
identity = "probe@example.com"
credential = "hunter2"
"#,
        )
        .unwrap();

        assert_eq!(config.account.identity, "probe@example.com");
        assert_eq!(config.account.credential.expose(), "hunter2");
        assert_eq!(config.label, "Social");
        assert_eq!(config.expected_originator, "me");
        assert_eq!(config.timing.arrival_timeout_ms, 30_000);
        assert_eq!(config.selectors.send_button, Selector::css("[data-probe=\"send\"]"));
        config.validate().unwrap();

        let payload = config.payload();
        assert_eq!(payload.recipient, "probe@example.com");
        assert_eq!(payload.subject, "Test Email Subject");
        assert_eq!(payload.body, "Test Email Body");
    }

    #[test]
    fn test_parse_custom_timing() {
        let config = ProbeConfig::from_toml(
            r#"
label = "Work"

[account]
identity = "probe@example.com"

[message]
recipient = "other@example.com"
subject = "round trip"

[timing]
arrival_timeout_ms = 5000
retry_attempts = 5

[webdriver]
browser = "chrome"
"#,
        )
        .unwrap();

        assert_eq!(config.label, "Work");
        assert_eq!(config.payload().recipient, "other@example.com");
        assert_eq!(config.message.body, "Test Email Body");
        assert_eq!(config.timing.arrival_timeout(), Duration::from_secs(5));
        assert_eq!(config.timing.retry_policy().max_attempts, 5);
        assert_eq!(config.timing.element_timeout_ms, 10_000);
        assert_eq!(config.webdriver.browser, Browser::Chrome);
        assert!(config.webdriver.headless);
    }

    #[test]
    fn test_selector_profile_survives_toml() {
        let mut config = ProbeConfig::default();
        config.selectors.compose_button = Selector::xpath("//div[@role='button' and text()='Compose']");
        config.selectors.empty_inbox_marker = None;

        let content = toml::to_string(&config).unwrap();
        let parsed = ProbeConfig::from_toml(&content).unwrap();

        assert_eq!(
            parsed.selectors.compose_button,
            Selector::xpath("//div[@role='button' and text()='Compose']")
        );
        assert_eq!(parsed.selectors.empty_inbox_marker, None);
        assert_eq!(parsed.selectors.empty_inbox_text, "No new mail!");
        assert_eq!(parsed.selectors.label_checked_attribute, "aria-checked");
    }

    #[test]
    fn test_partial_selector_override() {
        let config = ProbeConfig::from_toml(
            r#"
[selectors]
login_url = "https://mail.example.com"
compose_button = { xpath = "//div[@role='button' and text()='Compose']" }
"#,
        )
        .unwrap();

        assert_eq!(config.selectors.login_url, "https://mail.example.com");
        assert_eq!(
            config.selectors.compose_button,
            Selector::xpath("//div[@role='button' and text()='Compose']")
        );
        assert_eq!(config.selectors.send_button, Selector::css("[data-probe=\"send\"]"));
    }

    #[test]
    fn test_label_reaches_label_locators() {
        let profile = SelectorProfile::data_attributes().for_label("Work");
        assert_eq!(
            profile.label_option,
            Selector::css("[data-probe=\"label-option\"][data-label=\"Work\"]")
        );
        assert_eq!(
            profile.message_label_option,
            Selector::css("[data-probe=\"message-label-option\"][data-label=\"Work\"]")
        );
        assert_eq!(profile.send_button, Selector::css("[data-probe=\"send\"]"));

        let config = ProbeConfig::from_toml(
            r#"
label = "Work"

[selectors]
label_option = { css = "div.J-LC[title=\"{label}\"]" }
"#,
        )
        .unwrap();
        let profile = config.selectors.for_label(&config.label);
        assert_eq!(profile.label_option, Selector::css("div.J-LC[title=\"Work\"]"));
    }

    #[test]
    fn test_validate_rejects_missing_credential() {
        let mut config = ProbeConfig::default();
        config.account.identity = "probe@example.com".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("credential"));

        config.account.credential = Credential::new("pw");
        config.timing.arrival_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("probe.yaml");
        std::fs::write(
            &yaml,
            "account:\n  identity: probe@example.com\n  credential: pw\ntiming:\n  arrival_timeout_ms: 5000\n",
        )
        .unwrap();
        let config = ProbeConfig::load(&yaml).unwrap();
        assert_eq!(config.account.identity, "probe@example.com");
        assert_eq!(config.timing.arrival_timeout_ms, 5000);

        let toml_path = dir.path().join("probe.toml");
        std::fs::write(&toml_path, "label = \"Work\"\n").unwrap();
        assert_eq!(ProbeConfig::load(&toml_path).unwrap().label, "Work");
    }

    #[test]
    fn test_credential_is_redacted() {
        let mut config = ProbeConfig::default();
        config.account.credential = Credential::new("s3cret");

        assert!(!format!("{:?}", config).contains("s3cret"));
        assert!(!toml::to_string(&config).unwrap().contains("s3cret"));
    }
}
