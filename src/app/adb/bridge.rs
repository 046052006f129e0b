use std::path::Path;
use std::time::Duration;

use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::config::{ApkInstallSettings, ToolSettings};
use crate::app::error::AppError;

/// The two device-bridge capabilities the pipeline needs.
pub trait DeviceBridge: Send + Sync {
    /// Raw `adb devices -l` output.
    fn list_devices(&self, trace_id: &str) -> Result<String, AppError>;

    fn install(
        &self,
        serial: &str,
        archive: &Path,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;
}

pub struct AdbBridge {
    program: String,
    command_timeout: Duration,
    install_timeout: Duration,
    install: ApkInstallSettings,
}

impl AdbBridge {
    pub fn new(tools: &ToolSettings, install: &ApkInstallSettings) -> Self {
        Self {
            program: tools.adb_path.clone(),
            command_timeout: Duration::from_secs(tools.command_timeout_secs),
            install_timeout: Duration::from_secs(tools.install_timeout_secs),
            install: install.clone(),
        }
    }
}

impl DeviceBridge for AdbBridge {
    fn list_devices(&self, trace_id: &str) -> Result<String, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output =
            run_command_with_timeout(&self.program, &args, self.command_timeout, trace_id)?;
        if !output.succeeded() {
            return Err(AppError::dependency(
                format!("adb devices failed: {}", output.combined()),
                trace_id,
            ));
        }
        Ok(output.stdout)
    }

    fn install(
        &self,
        serial: &str,
        archive: &Path,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let args = build_install_args(serial, archive, &self.install);
        run_command_with_timeout(&self.program, &args, self.install_timeout, trace_id)
    }
}

pub fn build_install_args(
    serial: &str,
    archive: &Path,
    settings: &ApkInstallSettings,
) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string(), "install".to_string()];
    if settings.replace_existing {
        args.push("-r".to_string());
    }
    if settings.allow_downgrade {
        args.push("-d".to_string());
    }
    if settings.grant_permissions {
        args.push("-g".to_string());
    }
    if settings.allow_test_packages {
        args.push("-t".to_string());
    }
    args.push(archive.to_string_lossy().to_string());
    args
}
