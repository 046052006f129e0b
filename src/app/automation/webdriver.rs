use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::app::automation::{AutomationDriver, AutomationSession, LogEntry, SessionRequest};
use crate::app::config::AutomationSettings;
use crate::app::error::AppError;
use crate::app::ui_capture::write_png_base64;

/// W3C WebDriver client for an Appium server.
pub struct WebDriverClient {
    endpoint: String,
    http: Client,
}

impl WebDriverClient {
    /// Must be built outside an async runtime; the blocking client owns its own.
    pub fn new(settings: &AutomationSettings, trace_id: &str) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|err| {
                AppError::system(format!("Failed to build HTTP client: {err}"), trace_id)
            })?;
        Ok(Self {
            endpoint: settings.endpoint_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

impl AutomationDriver for WebDriverClient {
    fn open(
        &self,
        request: &SessionRequest,
        trace_id: &str,
    ) -> Result<Box<dyn AutomationSession>, AppError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": request.capabilities(),
                "firstMatch": [{}],
            }
        });
        let url = format!("{}/session", self.endpoint);
        let reply = send_raw(self.http.post(&url).json(&body), "Create session", trace_id)?;
        let session_id = parse_session_id(&reply).ok_or_else(|| {
            AppError::dependency("Automation server returned no session id", trace_id)
        })?;
        info!(
            trace_id = %trace_id,
            session_id = %session_id,
            device = %request.device.identifier,
            package = %request.app.package_id,
            "automation session opened"
        );
        Ok(Box::new(WebDriverSession {
            http: self.http.clone(),
            base_url: format!("{}/session/{}", self.endpoint, session_id),
            session_id,
            trace_id: trace_id.to_string(),
            closed: false,
        }))
    }
}

pub struct WebDriverSession {
    http: Client,
    base_url: String,
    session_id: String,
    trace_id: String,
    closed: bool,
}

impl AutomationSession for WebDriverSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn capture_screenshot(&mut self, path: &Path) -> Result<(), AppError> {
        let url = format!("{}/screenshot", self.base_url);
        let value = send(self.http.get(&url), "Screenshot", &self.trace_id)?;
        let encoded = value
            .as_str()
            .ok_or_else(|| {
                AppError::dependency("Screenshot response was not a string", &self.trace_id)
            })?;
        let bytes = write_png_base64(encoded, path)
            .map_err(|message| AppError::dependency(message, &self.trace_id))?;
        debug!(trace_id = %self.trace_id, bytes, path = %path.display(), "screenshot saved");
        Ok(())
    }

    fn page_source(&mut self) -> Result<String, AppError> {
        let url = format!("{}/source", self.base_url);
        let value = send(self.http.get(&url), "Page source", &self.trace_id)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn device_log(&mut self, channel: &str) -> Result<Vec<LogEntry>, AppError> {
        let url = format!("{}/se/log", self.base_url);
        let value = send(
            self.http.post(&url).json(&json!({ "type": channel })),
            "Device log",
            &self.trace_id,
        )?;
        Ok(parse_log_entries(value))
    }

    fn close(&mut self) -> Result<(), AppError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        send(self.http.delete(&self.base_url), "Delete session", &self.trace_id)?;
        info!(
            trace_id = %self.trace_id,
            session_id = %self.session_id,
            "automation session closed"
        );
        Ok(())
    }
}

/// The `value` member of a successful reply.
fn send(request: RequestBuilder, action: &str, trace_id: &str) -> Result<Value, AppError> {
    Ok(match send_raw(request, action, trace_id)? {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        other => other,
    })
}

/// Whole reply body, after WebDriver errors and HTTP failures are turned into `Err`.
fn send_raw(request: RequestBuilder, action: &str, trace_id: &str) -> Result<Value, AppError> {
    let response = request
        .send()
        .map_err(|err| AppError::dependency(format!("{action} request failed: {err}"), trace_id))?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|err| {
            AppError::dependency(format!("{action} response unreadable: {err}"), trace_id)
        })?;
    let body: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).map_err(|err| {
            AppError::dependency(format!("{action} response is not JSON: {err}"), trace_id)
        })?
    };
    if let Some(message) = webdriver_error(&body) {
        return Err(AppError::dependency(format!("{action} failed: {message}"), trace_id));
    }
    if !status.is_success() {
        return Err(AppError::dependency(
            format!("{action} failed with HTTP {}", status.as_u16()),
            trace_id,
        ));
    }
    Ok(body)
}

/// `error: message` from a W3C error payload, if the body is one.
pub fn webdriver_error(body: &Value) -> Option<String> {
    let value = body.get("value")?;
    let error = value.get("error")?.as_str()?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(|message| message.lines().next().unwrap_or_default().trim())
        .unwrap_or_default();
    if message.is_empty() {
        Some(error.to_string())
    } else {
        Some(format!("{error}: {message}"))
    }
}

/// Reads the id from a full new-session reply: W3C puts it inside `value`, older
/// JSON-wire servers put it at the top level.
pub fn parse_session_id(reply: &Value) -> Option<String> {
    let non_empty = |holder: Option<&Value>| {
        holder
            .and_then(|holder| holder.get("sessionId"))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
    };
    non_empty(reply.get("value")).or_else(|| non_empty(Some(reply)))
}

pub fn parse_log_entries(value: Value) -> Vec<LogEntry> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(message) => LogEntry {
                    message,
                    ..LogEntry::default()
                },
                other => serde_json::from_value::<LogEntry>(other).unwrap_or_default(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_w3c_session_id() {
        let reply = json!({
            "value": { "sessionId": "4f1c6a", "capabilities": { "platformName": "Android" } }
        });
        assert_eq!(parse_session_id(&reply).as_deref(), Some("4f1c6a"));
        assert_eq!(parse_session_id(&json!({ "value": { "sessionId": "" } })), None);
        assert_eq!(parse_session_id(&Value::Null), None);
    }

    #[test]
    fn extracts_json_wire_session_id_from_top_level() {
        let reply = json!({
            "status": 0,
            "sessionId": "legacy-77",
            "value": { "platformName": "Android", "deviceName": "emulator-5554" }
        });
        assert_eq!(parse_session_id(&reply).as_deref(), Some("legacy-77"));
    }

    #[test]
    fn reads_webdriver_error_payload() {
        let body = json!({
            "value": {
                "error": "session not created",
                "message": "Could not find a connected Android device in 20000ms.\n    at getDevices",
                "stacktrace": "..."
            }
        });
        assert_eq!(
            webdriver_error(&body).as_deref(),
            Some("session not created: Could not find a connected Android device in 20000ms.")
        );
        assert_eq!(webdriver_error(&json!({ "value": "iVBORw0KGgo=" })), None);
        assert_eq!(webdriver_error(&json!({ "value": null })), None);
    }

    #[test]
    fn parses_logcat_entries() {
        let value = json!([
            { "timestamp": 1700000000000i64, "level": "ALL", "message": "E AndroidRuntime: FATAL EXCEPTION: main" },
            { "timestamp": 1700000000001i64, "level": "ALL", "message": "I ActivityManager: Start proc" },
            "raw line without fields"
        ]);
        let entries = parse_log_entries(value);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp, 1_700_000_000_000);
        assert!(entries[0].message.contains("FATAL"));
        assert_eq!(entries[2].message, "raw line without fields");
        assert!(parse_log_entries(Value::Null).is_empty());
    }
}
