//! The fixed verification sequence run against one archive.
//!
//! Steps 1-4 are preconditions and halt the run on failure. Steps 5-7 are diagnostics:
//! a failed check is recorded and the run continues, while a lost session ends it.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::device::locate;
use crate::app::automation::{AutomationDriver, SessionGuard, SessionRequest};
use crate::app::config::AppConfig;
use crate::app::models::{
    ApkInstallErrorCode, AppDescriptor, DeviceHandle, FailureKind, RunResult, StepOutcome,
};
use crate::app::package::{inspect, MetadataTool};
use crate::app::scheduler::TaskScheduler;


pub const STEP_DEVICE_DETECTION: &str = "Device Detection";
pub const STEP_INSTALL: &str = "Install";
pub const STEP_READ_APP_INFO: &str = "Read App Info";
pub const STEP_APP_LAUNCH: &str = "App Launch";
pub const STEP_SCREENSHOT: &str = "Screenshot";
pub const STEP_UI_CHECK: &str = "UI Check";
pub const STEP_CRASH_CHECK: &str = "Crash Check";
/// Terminal outcome for faults raised outside any step.
pub const STEP_TEST_RUN: &str = "Test Run";

const SCREENSHOT_FILE: &str = "launch.png";
const MAX_DETAIL_LEN: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub min_page_source_len: usize,
    pub crash_markers: Vec<String>,
    pub log_channel: String,
    pub launch_settle: Duration,
    pub new_command_timeout_secs: u64,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_page_source_len: config.checks.min_page_source_len,
            crash_markers: config.checks.crash_markers.clone(),
            log_channel: config.automation.log_channel.clone(),
            launch_settle: Duration::from_millis(config.automation.launch_settle_ms),
            new_command_timeout_secs: config.automation.new_command_timeout_secs,
        }
    }
}

pub struct StepRunner {
    bridge: Arc<dyn DeviceBridge>,
    metadata: Arc<dyn MetadataTool>,
    driver: Arc<dyn AutomationDriver>,
    scheduler: Arc<TaskScheduler>,
    settings: RunSettings,
}

/// Precondition failed; the outcome is already recorded.
struct Halt;

impl StepRunner {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        metadata: Arc<dyn MetadataTool>,
        driver: Arc<dyn AutomationDriver>,
        scheduler: Arc<TaskScheduler>,
        settings: RunSettings,
    ) -> Self {
        Self {
            bridge,
            metadata,
            driver,
            scheduler,
            settings,
        }
    }

    /// Never fails: every fault ends up as a FAILED outcome in the returned steps.
    pub fn run(&self, archive: &Path, artifacts_dir: &Path, trace_id: &str) -> RunResult {
        let mut result = RunResult::default();
        let phase = Cell::new(STEP_TEST_RUN);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _ = self.run_steps(archive, artifacts_dir, trace_id, &phase, &mut result);
        }));
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            let step = phase.get();
            warn!(trace_id = %trace_id, step = %step, error = %message, "test run panicked");
            record(
                &mut result,
                StepOutcome::failed(
                    step,
                    FailureKind::Internal,
                    format!("Internal error: {message}"),
                ),
                trace_id,
            );
        }
        result
    }

    fn run_steps(
        &self,
        archive: &Path,
        artifacts_dir: &Path,
        trace_id: &str,
        phase: &Cell<&'static str>,
        out: &mut RunResult,
    ) -> Result<(), Halt> {
        phase.set(STEP_DEVICE_DETECTION);
        let device = self.detect_device(trace_id, out)?;

        // Held until the session guard below is gone.
        let device_lock = self.scheduler.device_lock(&device.identifier);
        let _device_guard = match device_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        phase.set(STEP_INSTALL);
        self.install(&device, archive, trace_id, out)?;
        phase.set(STEP_READ_APP_INFO);
        let app = self.read_app_info(archive, trace_id, out)?;
        phase.set(STEP_APP_LAUNCH);
        let mut session = self.launch(&device, &app, trace_id, out)?;

        phase.set(STEP_SCREENSHOT);
        let screenshot_path = artifacts_dir.join(SCREENSHOT_FILE);
        let screenshot = session
            .session()
            .and_then(|active| active.capture_screenshot(&screenshot_path));
        match screenshot {
            Ok(()) => record(
                out,
                StepOutcome::passed(STEP_SCREENSHOT, "Launch screenshot captured")
                    .with_artifact(screenshot_path.to_string_lossy()),
                trace_id,
            ),
            Err(err) => record(
                out,
                StepOutcome::failed(
                    STEP_SCREENSHOT,
                    FailureKind::SessionFailure,
                    format!("Screenshot failed: {}", err.error),
                ),
                trace_id,
            ),
        }

        phase.set(STEP_UI_CHECK);
        let source = match session.session().and_then(|active| active.page_source()) {
            Ok(source) => source,
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_UI_CHECK,
                        FailureKind::SessionFailure,
                        format!("Could not read UI source: {}", err.error),
                    ),
                    trace_id,
                );
                return Err(Halt);
            }
        };
        let source_len = source.trim().chars().count();
        if source_len > self.settings.min_page_source_len {
            record(
                out,
                StepOutcome::passed(
                    STEP_UI_CHECK,
                    format!("App UI loaded successfully ({source_len} chars of UI source)"),
                ),
                trace_id,
            );
        } else {
            record(
                out,
                StepOutcome::failed(
                    STEP_UI_CHECK,
                    FailureKind::CheckFailed,
                    format!(
                        "App UI did not load ({source_len} chars of UI source, need more than {})",
                        self.settings.min_page_source_len
                    ),
                ),
                trace_id,
            );
        }

        phase.set(STEP_CRASH_CHECK);
        let channel = self.settings.log_channel.as_str();
        let entries = match session.session().and_then(|active| active.device_log(channel)) {
            Ok(entries) => entries,
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_CRASH_CHECK,
                        FailureKind::SessionFailure,
                        format!("Could not read {channel} log: {}", err.error),
                    ),
                    trace_id,
                );
                return Err(Halt);
            }
        };
        let crashes = entries
            .iter()
            .filter(|entry| entry.contains_any(&self.settings.crash_markers))
            .count();
        if crashes > 0 {
            record(
                out,
                StepOutcome::failed(
                    STEP_CRASH_CHECK,
                    FailureKind::CheckFailed,
                    format!("{crashes} crash(es) detected"),
                ),
                trace_id,
            );
        } else {
            record(
                out,
                StepOutcome::passed(STEP_CRASH_CHECK, "No crashes detected"),
                trace_id,
            );
        }

        phase.set(STEP_TEST_RUN);
        if let Err(err) = session.close() {
            warn!(trace_id = %trace_id, error = %err, "failed to close automation session");
        }
        Ok(())
    }

    fn detect_device(&self, trace_id: &str, out: &mut RunResult) -> Result<DeviceHandle, Halt> {
        match locate(self.bridge.as_ref(), trace_id) {
            Ok(Some(device)) => {
                record(
                    out,
                    StepOutcome::passed(
                        STEP_DEVICE_DETECTION,
                        format!("{} found: {}", device.kind.label(), device.identifier),
                    ),
                    trace_id,
                );
                out.device = Some(device.clone());
                Ok(device)
            }
            Ok(None) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_DEVICE_DETECTION,
                        FailureKind::NotFound,
                        "No device or emulator connected",
                    ),
                    trace_id,
                );
                Err(Halt)
            }
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_DEVICE_DETECTION,
                        FailureKind::ToolFailure,
                        format!("Device detection failed: {}", err.error),
                    ),
                    trace_id,
                );
                Err(Halt)
            }
        }
    }

    fn install(
        &self,
        device: &DeviceHandle,
        archive: &Path,
        trace_id: &str,
        out: &mut RunResult,
    ) -> Result<(), Halt> {
        let output = match self.bridge.install(&device.identifier, archive, trace_id) {
            Ok(output) => output,
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_INSTALL,
                        FailureKind::ToolFailure,
                        format!("Install failed: {}", err.error),
                    ),
                    trace_id,
                );
                return Err(Halt);
            }
        };
        let raw = output.combined();
        let code = match ApkInstallErrorCode::from_output(&raw) {
            ApkInstallErrorCode::Success if !output.succeeded() => {
                ApkInstallErrorCode::UnknownError
            }
            code => code,
        };
        if code.is_success() {
            record(
                out,
                StepOutcome::passed(
                    STEP_INSTALL,
                    format!("APK installed on {}", device.kind.label()),
                ),
                trace_id,
            );
            return Ok(());
        }
        record(
            out,
            StepOutcome::failed(
                STEP_INSTALL,
                FailureKind::Rejected,
                truncate_detail(&format!(
                    "{}: {} ({})",
                    code.code(),
                    code.description(),
                    raw.trim()
                )),
            ),
            trace_id,
        );
        Err(Halt)
    }

    fn read_app_info(
        &self,
        archive: &Path,
        trace_id: &str,
        out: &mut RunResult,
    ) -> Result<AppDescriptor, Halt> {
        match inspect(self.metadata.as_ref(), archive, trace_id) {
            Ok(Some(app)) => {
                record(
                    out,
                    StepOutcome::passed(
                        STEP_READ_APP_INFO,
                        format!("Package: {}, Activity: {}", app.package_id, app.entry_activity),
                    ),
                    trace_id,
                );
                out.app = Some(app.clone());
                Ok(app)
            }
            Ok(None) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_READ_APP_INFO,
                        FailureKind::Incomplete,
                        "Could not read package or launchable activity",
                    ),
                    trace_id,
                );
                Err(Halt)
            }
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_READ_APP_INFO,
                        FailureKind::ToolFailure,
                        format!("Package inspection failed: {}", err.error),
                    ),
                    trace_id,
                );
                Err(Halt)
            }
        }
    }

    fn launch(
        &self,
        device: &DeviceHandle,
        app: &AppDescriptor,
        trace_id: &str,
        out: &mut RunResult,
    ) -> Result<SessionGuard, Halt> {
        let request = SessionRequest {
            device: device.clone(),
            app: app.clone(),
            new_command_timeout_secs: self.settings.new_command_timeout_secs,
        };
        let mut session = match self.driver.open(&request, trace_id) {
            Ok(session) => SessionGuard::new(session, trace_id),
            Err(err) => {
                record(
                    out,
                    StepOutcome::failed(
                        STEP_APP_LAUNCH,
                        FailureKind::SessionFailure,
                        format!("App launch failed: {}", err.error),
                    ),
                    trace_id,
                );
                return Err(Halt);
            }
        };

        // Appium hands out log entries newer than the last read, so draining here keeps
        // earlier runs and boot noise out of the crash check.
        let channel = self.settings.log_channel.as_str();
        if let Err(err) = session.session().and_then(|active| active.device_log(channel)) {
            warn!(trace_id = %trace_id, error = %err, "failed to drain device log at launch");
        }
        if !self.settings.launch_settle.is_zero() {
            std::thread::sleep(self.settings.launch_settle);
        }

        record(
            out,
            StepOutcome::passed(
                STEP_APP_LAUNCH,
                format!("App launched on {}: {}", device.kind.label(), device.identifier),
            ),
            trace_id,
        );
        Ok(session)
    }
}

fn record(out: &mut RunResult, outcome: StepOutcome, trace_id: &str) {
    if outcome.is_failed() {
        warn!(trace_id = %trace_id, step = %outcome.name, detail = %outcome.detail, "step failed");
    } else {
        info!(trace_id = %trace_id, step = %outcome.name, detail = %outcome.detail, "step passed");
    }
    out.steps.push(outcome);
}

fn truncate_detail(value: &str) -> String {
    if value.chars().count() <= MAX_DETAIL_LEN {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(MAX_DETAIL_LEN).collect();
    truncated.push_str("...");
    truncated
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
