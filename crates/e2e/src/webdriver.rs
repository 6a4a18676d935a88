//! W3C WebDriver client
//!
//! Talks to geckodriver or chromedriver over the WebDriver HTTP protocol.
//! Only the commands the [`Driver`] seam needs are implemented.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{Browser, WebDriverConfig};
use crate::driver::{Driver, ElementHandle, Selector};
use crate::error::{DriverError, DriverResult};
use crate::waiter::{poll, PollPolicy};

/// Key under which W3C drivers return element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const FORCE_CLICK_SCRIPT: &str = "arguments[0].click();";

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Map a W3C error code onto the driver taxonomy.
pub fn map_error(code: &str, message: &str) -> DriverError {
    let message = message.to_string();
    match code {
        "no such element" => DriverError::NotFound(message),
        "element not interactable" | "element click intercepted" => DriverError::NotInteractable(message),
        "stale element reference" => DriverError::Stale(message),
        "invalid selector" => DriverError::Malformed(message),
        other => DriverError::Session(format!("{}: {}", other, message)),
    }
}

/// New-session capabilities for the configured browser.
pub fn capabilities(config: &WebDriverConfig) -> Value {
    let mut always = json!({ "browserName": config.browser.as_str() });
    if config.headless {
        let (key, arg) = match config.browser {
            Browser::Firefox => ("moz:firefoxOptions", "-headless"),
            Browser::Chrome => ("goog:chromeOptions", "--headless=new"),
        };
        always[key] = json!({ "args": [arg] });
    }
    json!({ "capabilities": { "alwaysMatch": always } })
}

fn element_from(value: &Value) -> DriverResult<ElementHandle> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(ElementHandle::new)
        .ok_or_else(|| DriverError::Malformed(format!("response is not an element reference: {}", value)))
}

async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> DriverResult<Value> {
    let mut request = client.request(method.clone(), url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await?;
    let status = response.status();
    let mut payload: Value = response.json().await?;
    let value = payload.get_mut("value").map(Value::take).unwrap_or(Value::Null);

    if status.is_success() {
        debug!(%method, url, %status, "webdriver ok");
        return Ok(value);
    }

    let wire: WireError = serde_json::from_value(value)
        .map_err(|e| DriverError::Session(format!("HTTP {} with unreadable error body: {}", status, e)))?;
    debug!(%method, url, %status, code = %wire.error, "webdriver error");
    Err(map_error(&wire.error, &wire.message))
}

/// A live WebDriver session.
pub struct WebDriverSession {
    client: Client,
    base: String,
    closed: AtomicBool,
}

impl WebDriverSession {
    /// Wait for the WebDriver server to report ready, then open a session.
    pub async fn connect(config: &WebDriverConfig) -> DriverResult<Self> {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let client = Client::builder().timeout(request_timeout).build()?;
        let root = config.url.trim_end_matches('/').to_string();

        let status_url = format!("{}/status", root);
        let policy = PollPolicy::new(request_timeout, Duration::from_millis(250));
        let (http, url) = (&client, status_url.as_str());
        let signal = poll(&policy, "webdriver ready", || async move {
            match send(http, Method::GET, url, None).await {
                Ok(v) => Ok(v.get("ready").and_then(Value::as_bool).unwrap_or(false).then_some(())),
                // connection refused while the driver is starting
                Err(DriverError::Transport(e)) => {
                    debug!("webdriver not reachable yet: {}", e);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        if signal.is_timed_out() {
            return Err(DriverError::Session(format!(
                "WebDriver at {} not ready after {} poll(s)",
                root,
                signal.polls()
            )));
        }

        let created = send(&client, Method::POST, &format!("{}/session", root), Some(capabilities(config))).await?;
        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Malformed("new session response has no sessionId".into()))?;

        info!(session = session_id, browser = config.browser.as_str(), "WebDriver session started");

        Ok(Self {
            base: format!("{}/session/{}", root, session_id),
            client,
            closed: AtomicBool::new(false),
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> DriverResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Session("session closed".into()));
        }
        send(&self.client, method, &format!("{}{}", self.base, path), body).await
    }

    fn locator(selector: &Selector) -> Value {
        json!({ "using": selector.strategy(), "value": selector.value() })
    }
}

#[async_trait]
impl Driver for WebDriverSession {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    async fn locate(&self, selector: &Selector) -> DriverResult<ElementHandle> {
        let value = self
            .command(Method::POST, "/element", Some(Self::locator(selector)))
            .await
            .map_err(|e| match e {
                DriverError::NotFound(_) => DriverError::NotFound(selector.to_string()),
                other => other,
            })?;
        element_from(&value)
    }

    async fn locate_all(&self, selector: &Selector) -> DriverResult<Vec<ElementHandle>> {
        let value = self
            .command(Method::POST, "/elements", Some(Self::locator(selector)))
            .await?;
        value
            .as_array()
            .ok_or_else(|| DriverError::Malformed("find elements did not return a list".into()))?
            .iter()
            .map(element_from)
            .collect()
    }

    async fn click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.command(Method::POST, &format!("/element/{}/click", element.id()), Some(json!({})))
            .await?;
        Ok(())
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> DriverResult<()> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.id()),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    async fn read_text(&self, element: &ElementHandle) -> DriverResult<String> {
        let value = self
            .command(Method::GET, &format!("/element/{}/text", element.id()), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn read_attribute(&self, element: &ElementHandle, name: &str) -> DriverResult<Option<String>> {
        let value = self
            .command(Method::GET, &format!("/element/{}/attribute/{}", element.id(), name), None)
            .await?;
        Ok(match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    async fn force_click(&self, element: &ElementHandle) -> DriverResult<()> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({
                "script": FORCE_CLICK_SCRIPT,
                "args": [{ ELEMENT_KEY: element.id() }],
            })),
        )
        .await?;
        Ok(())
    }

    async fn close_session(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Session("session already closed".into()));
        }
        send(&self.client, Method::DELETE, &self.base, None).await?;
        info!("WebDriver session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("no such element", "NotFound")]
    #[test_case("element not interactable", "NotInteractable")]
    #[test_case("element click intercepted", "NotInteractable")]
    #[test_case("stale element reference", "Stale")]
    #[test_case("invalid selector", "Malformed")]
    #[test_case("invalid session id", "Session")]
    fn test_map_error(code: &str, expected: &str) {
        let mapped = map_error(code, "details");
        let name = match mapped {
            DriverError::NotFound(_) => "NotFound",
            DriverError::NotInteractable(_) => "NotInteractable",
            DriverError::Stale(_) => "Stale",
            DriverError::Malformed(_) => "Malformed",
            DriverError::Session(_) => "Session",
            DriverError::Transport(_) => "Transport",
        };
        assert_eq!(name, expected);
    }

    #[test]
    fn test_headless_firefox_capabilities() {
        let caps = capabilities(&WebDriverConfig::default());
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "firefox");
        assert_eq!(always["moz:firefoxOptions"]["args"][0], "-headless");
    }

    #[test]
    fn test_headed_chrome_capabilities() {
        let config = WebDriverConfig {
            browser: Browser::Chrome,
            headless: false,
            ..Default::default()
        };
        let caps = capabilities(&config);
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert!(always.get("goog:chromeOptions").is_none());
    }

    #[test]
    fn test_element_reference_parsing() {
        let el = element_from(&json!({ ELEMENT_KEY: "abc-123" })).unwrap();
        assert_eq!(el.id(), "abc-123");
        assert!(matches!(
            element_from(&json!({ "ELEMENT": "legacy" })),
            Err(DriverError::Malformed(_))
        ));
    }
}
