//! Instrumented sessions against one app on one device.
//!
//! The pipeline only talks to [`AutomationDriver`] and [`AutomationSession`]; the WebDriver
//! implementation lives in [`webdriver`]. Every opened session is wrapped in a
//! [`SessionGuard`], which closes it on drop so no exit path leaves a session behind.

pub mod webdriver;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::app::error::AppError;
use crate::app::models::{AppDescriptor, DeviceHandle};

pub const PLATFORM_NAME: &str = "Android";
pub const AUTOMATION_NAME: &str = "UiAutomator2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub device: DeviceHandle,
    pub app: AppDescriptor,
    pub new_command_timeout_secs: u64,
}

impl SessionRequest {
    /// Keeps app data between runs and grants runtime permissions up front so
    /// permission dialogs never cover the launched UI.
    pub fn capabilities(&self) -> Value {
        json!({
            "platformName": PLATFORM_NAME,
            "appium:automationName": AUTOMATION_NAME,
            "appium:deviceName": self.device.identifier,
            "appium:udid": self.device.identifier,
            "appium:appPackage": self.app.package_id,
            "appium:appActivity": self.app.entry_activity,
            "appium:noReset": true,
            "appium:autoGrantPermissions": true,
            "appium:newCommandTimeout": self.new_command_timeout_secs,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

impl LogEntry {
    pub fn contains_any(&self, markers: &[String]) -> bool {
        markers
            .iter()
            .any(|marker| {
                self.message.contains(marker.as_str()) || self.level.contains(marker.as_str())
            })
    }
}

pub trait AutomationDriver: Send + Sync {
    fn open(
        &self,
        request: &SessionRequest,
        trace_id: &str,
    ) -> Result<Box<dyn AutomationSession>, AppError>;
}

pub trait AutomationSession: Send {
    fn session_id(&self) -> &str;

    fn capture_screenshot(&mut self, path: &Path) -> Result<(), AppError>;

    fn page_source(&mut self) -> Result<String, AppError>;

    /// Entries newer than the previous read of the same channel.
    fn device_log(&mut self, channel: &str) -> Result<Vec<LogEntry>, AppError>;

    fn close(&mut self) -> Result<(), AppError>;
}

pub struct SessionGuard {
    session: Option<Box<dyn AutomationSession>>,
    trace_id: String,
}

impl SessionGuard {
    pub fn new(session: Box<dyn AutomationSession>, trace_id: &str) -> Self {
        Self {
            session: Some(session),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn session(&mut self) -> Result<&mut dyn AutomationSession, AppError> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(AppError::system("Automation session already closed", &self.trace_id)),
        }
    }

    pub fn close(mut self) -> Result<(), AppError> {
        match self.session.take() {
            Some(mut session) => session.close(),
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let session_id = session.session_id().to_string();
            if let Err(err) = session.close() {
                warn!(
                    trace_id = %self.trace_id,
                    session_id = %session_id,
                    error = %err,
                    "failed to close automation session"
                );
            }
        }
    }
}
