//! Fakes shared by unit tests that need a runner but no device.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::runner::CommandOutput;
use crate::app::automation::{AutomationDriver, AutomationSession, SessionRequest};
use crate::app::error::AppError;
use crate::app::package::MetadataTool;
use crate::app::scheduler::TaskScheduler;
use crate::app::steps::{RunSettings, StepRunner};

pub struct EmptyBridge;

impl DeviceBridge for EmptyBridge {
    fn list_devices(&self, _trace_id: &str) -> Result<String, AppError> {
        Ok("List of devices attached\n\n".to_string())
    }

    fn install(&self, _: &str, _: &Path, trace_id: &str) -> Result<CommandOutput, AppError> {
        Err(AppError::system("unexpected install", trace_id))
    }
}

pub struct UnusedTool;

impl MetadataTool for UnusedTool {
    fn dump_badging(&self, _: &Path, trace_id: &str) -> Result<CommandOutput, AppError> {
        Err(AppError::system("unexpected aapt call", trace_id))
    }
}

pub struct UnusedDriver;

impl AutomationDriver for UnusedDriver {
    fn open(
        &self,
        _: &SessionRequest,
        trace_id: &str,
    ) -> Result<Box<dyn AutomationSession>, AppError> {
        Err(AppError::system("unexpected session", trace_id))
    }
}

/// Reports `started` on device listing, then holds the run until `release` fires.
pub struct GatedBridge {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl DeviceBridge for GatedBridge {
    fn list_devices(&self, trace_id: &str) -> Result<String, AppError> {
        let _ = self.started.lock().expect("started").send(());
        self.release
            .lock()
            .expect("release")
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| AppError::system("gate never opened", trace_id))?;
        EmptyBridge.list_devices(trace_id)
    }

    fn install(
        &self,
        serial: &str,
        archive: &Path,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        EmptyBridge.install(serial, archive, trace_id)
    }
}

/// Every run ends at device detection with one FAILED step.
pub fn idle_runner() -> StepRunner {
    runner_with_bridge(Arc::new(EmptyBridge))
}

/// Like `idle_runner`, but each run blocks in device detection until released.
/// Returns the runner, the "run started" receiver and the release sender.
pub fn gated_runner() -> (StepRunner, Receiver<()>, Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let bridge = GatedBridge {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    };
    (runner_with_bridge(Arc::new(bridge)), started_rx, release_tx)
}

fn runner_with_bridge(bridge: Arc<dyn DeviceBridge>) -> StepRunner {
    StepRunner::new(
        bridge,
        Arc::new(UnusedTool),
        Arc::new(UnusedDriver),
        Arc::new(TaskScheduler::new()),
        RunSettings {
            min_page_source_len: 50,
            crash_markers: vec!["FATAL".to_string(), "ANR".to_string()],
            log_channel: "logcat".to_string(),
            launch_settle: Duration::ZERO,
            new_command_timeout_secs: 60,
        },
    )
}
