use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::config::ToolSettings;
use crate::app::error::AppError;
use crate::app::models::AppDescriptor;

/// The package-metadata capability (`aapt dump badging`).
pub trait MetadataTool: Send + Sync {
    fn dump_badging(&self, archive: &Path, trace_id: &str) -> Result<CommandOutput, AppError>;
}

pub struct AaptTool {
    program: String,
    timeout: Duration,
}

impl AaptTool {
    pub fn new(tools: &ToolSettings) -> Self {
        Self {
            program: tools.aapt_path.clone(),
            timeout: Duration::from_secs(tools.command_timeout_secs),
        }
    }
}

impl MetadataTool for AaptTool {
    fn dump_badging(&self, archive: &Path, trace_id: &str) -> Result<CommandOutput, AppError> {
        let args = vec![
            "dump".to_string(),
            "badging".to_string(),
            archive.to_string_lossy().to_string(),
        ];
        run_command_with_timeout(&self.program, &args, self.timeout, trace_id)
    }
}

fn quoted_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bname='([^']*)'").expect("valid badging regex"))
}

fn declared_name(line: &str) -> Option<String> {
    quoted_name_re()
        .captures(line)
        .map(|caps| caps[1].trim().to_string())
        .filter(|name| !name.is_empty())
}

/// First `package:` and first `launchable-activity:` declaration win.
pub fn parse_badging(output: &str) -> Option<AppDescriptor> {
    let mut package_id = None;
    let mut entry_activity = None;
    for line in output.lines() {
        let trimmed = line.trim_start();
        if package_id.is_none() && trimmed.starts_with("package:") {
            package_id = declared_name(trimmed);
        } else if entry_activity.is_none() && trimmed.starts_with("launchable-activity:") {
            entry_activity = declared_name(trimmed);
        }
        if package_id.is_some() && entry_activity.is_some() {
            break;
        }
    }
    Some(AppDescriptor {
        package_id: package_id?,
        entry_activity: entry_activity?,
    })
}

/// `Ok(None)` means the archive lacks a declaration; malformed archives land here too.
pub fn inspect(
    tool: &dyn MetadataTool,
    archive: &Path,
    trace_id: &str,
) -> Result<Option<AppDescriptor>, AppError> {
    let output = tool.dump_badging(archive, trace_id)?;
    if !output.succeeded() {
        debug!(
            trace_id = %trace_id,
            exit_code = ?output.exit_code,
            stderr = %output.stderr.trim(),
            "aapt reported a non-zero exit"
        );
    }
    Ok(parse_badging(&output.stdout))
}
