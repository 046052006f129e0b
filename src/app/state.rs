use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::app::adb::bridge::AdbBridge;
use crate::app::adb::locator::validate_program;
use crate::app::automation::webdriver::WebDriverClient;
use crate::app::config::AppConfig;
use crate::app::dispatcher::{Dispatcher, RunJob};
use crate::app::error::{AppError, ERR_VALIDATION};
use crate::app::models::{Report, ReportListItem};
use crate::app::package::AaptTool;
use crate::app::scheduler::TaskScheduler;
use crate::app::steps::{RunSettings, StepRunner};
use crate::app::store::{new_report_id, ReportStore, SqliteReportStore};

const MAX_ID_ATTEMPTS: usize = 5;
const DEFAULT_FILENAME: &str = "upload.apk";

/// Builds the runner against the real tools. Call outside any async runtime: the
/// automation client is a blocking HTTP client.
pub fn build_runner(config: &AppConfig, trace_id: &str) -> Result<StepRunner, AppError> {
    let driver = WebDriverClient::new(&config.automation, trace_id)?;
    Ok(StepRunner::new(
        Arc::new(AdbBridge::new(&config.tools, &config.apk_install)),
        Arc::new(AaptTool::new(&config.tools)),
        Arc::new(driver),
        Arc::new(TaskScheduler::new()),
        RunSettings::from_config(config),
    ))
}

pub struct AppState {
    pub config: AppConfig,
    store: Arc<dyn ReportStore>,
    dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn ReportStore>, runner: Arc<StepRunner>) -> Self {
        let dispatcher = Dispatcher::start(runner, Arc::clone(&store), config.dispatch.workers);
        Self {
            config,
            store,
            dispatcher,
        }
    }

    /// Production wiring: SQLite records under the data dir, real tools, WebDriver automation.
    pub fn from_config(config: AppConfig, trace_id: &str) -> Result<Self, AppError> {
        for dir in [config.uploads_dir(), config.reports_dir()] {
            fs::create_dir_all(&dir).map_err(|err| {
                AppError::system(
                    format!("Failed to create {}: {err}", dir.display()),
                    trace_id,
                )
            })?;
        }
        // A missing tool is reported per run as a failed step, not as a startup error.
        for (program, label) in [
            (config.tools.adb_path.as_str(), "ADB"),
            (config.tools.aapt_path.as_str(), "AAPT"),
        ] {
            if let Err(message) = validate_program(program, label) {
                warn!(trace_id = %trace_id, program = %program, "{message}");
            }
        }
        let store = SqliteReportStore::open(&config.database_path(), trace_id)?;
        let runner = build_runner(&config, trace_id)?;
        Ok(Self::new(config, Arc::new(store), Arc::new(runner)))
    }

    /// Stores the archive, records a RUNNING report and queues the run. The id is
    /// returned even when queueing fails; the report then stays RUNNING.
    pub fn submit_archive(
        &self,
        filename: &str,
        bytes: &[u8],
        trace_id: &str,
    ) -> Result<String, AppError> {
        if bytes.is_empty() {
            return Err(AppError::validation("Uploaded file is empty", trace_id));
        }
        if bytes.len() > self.config.server.max_upload_bytes {
            return Err(AppError::validation(
                format!(
                    "Uploaded file exceeds {} bytes",
                    self.config.server.max_upload_bytes
                ),
                trace_id,
            ));
        }
        let source_filename = sanitize_filename(filename);
        let uploads_dir = self.config.uploads_dir();
        fs::create_dir_all(&uploads_dir).map_err(|err| {
            AppError::system(format!("Failed to create upload directory: {err}"), trace_id)
        })?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let report_id = new_report_id();
            let archive_path = archive_path_for(&self.config, &report_id);
            if !write_archive(&uploads_dir, &archive_path, bytes, trace_id)? {
                continue;
            }
            match self.store.create(&report_id, &source_filename, trace_id) {
                Ok(_) => {}
                Err(err) if err.code == ERR_VALIDATION => {
                    let _ = fs::remove_file(&archive_path);
                    continue;
                }
                Err(err) => {
                    let _ = fs::remove_file(&archive_path);
                    return Err(err);
                }
            }
            info!(
                trace_id = %trace_id,
                report_id = %report_id,
                filename = %source_filename,
                bytes = bytes.len(),
                "archive accepted"
            );

            let artifacts_dir = self.config.reports_dir().join(&report_id).join("screenshots");
            let job = RunJob {
                report_id: report_id.clone(),
                archive_path,
                artifacts_dir,
                trace_id: trace_id.to_string(),
            };
            if let Err(err) = self.dispatcher.submit(job) {
                error!(
                    trace_id = %trace_id,
                    report_id = %report_id,
                    error = %err,
                    "failed to queue run; report stays RUNNING"
                );
            }
            return Ok(report_id);
        }
        Err(AppError::system(
            "Could not allocate a unique report id",
            trace_id,
        ))
    }

    pub fn get_report(&self, id: &str, trace_id: &str) -> Result<Report, AppError> {
        self.store
            .get(id, trace_id)?
            .ok_or_else(|| AppError::not_found(format!("Report {id} not found"), trace_id))
    }

    pub fn list_reports(&self, trace_id: &str) -> Result<Vec<ReportListItem>, AppError> {
        self.store.list(trace_id)
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Writes through a temp file in the same directory so readers never see a partial
/// archive. Returns `false` when the target already exists.
fn write_archive(
    dir: &Path,
    target: &Path,
    bytes: &[u8],
    trace_id: &str,
) -> Result<bool, AppError> {
    let mut temp = NamedTempFile::new_in(dir).map_err(|err| {
        AppError::system(format!("Failed to create upload file: {err}"), trace_id)
    })?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| AppError::system(format!("Failed to write upload: {err}"), trace_id))?;
    match temp.persist_noclobber(target) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
            warn!(trace_id = %trace_id, path = %target.display(), "upload path taken; retrying");
            Ok(false)
        }
        Err(err) => Err(AppError::system(
            format!("Failed to store upload: {}", err.error),
            trace_id,
        )),
    }
}

fn sanitize_filename(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = name.chars().filter(|ch| !ch.is_control()).collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        cleaned
    }
}

pub fn archive_path_for(config: &AppConfig, report_id: &str) -> PathBuf {
    config.uploads_dir().join(format!("{report_id}.apk"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ERR_NOT_FOUND;
    use crate::app::models::ReportStatus;
    use crate::app::store::MemoryReportStore;
    use crate::app::testing::idle_runner;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> (AppState, Arc<MemoryReportStore>) {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.server.max_upload_bytes = 64;
        config.dispatch.workers = 1;
        let store = Arc::new(MemoryReportStore::new());
        let state = AppState::new(config, store.clone(), Arc::new(idle_runner()));
        (state, store)
    }

    #[test]
    fn submission_stores_archive_and_completes_report() {
        let dir = TempDir::new().expect("tmp");
        let (state, _store) = state(&dir);

        let id = state
            .submit_archive("notes-release.apk", b"PK\x03\x04apk-bytes", "trace")
            .expect("submit");
        assert_eq!(id.len(), 8);

        let stored = fs::read(archive_path_for(&state.config, &id)).expect("archive");
        assert_eq!(stored, b"PK\x03\x04apk-bytes");
        let early = state.get_report(&id, "trace").expect("visible immediately");
        assert_eq!(early.source_filename, "notes-release.apk");

        state.shutdown();
        let report = state.get_report(&id, "trace").expect("report");
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.summary.total, 1);
        assert_eq!(report.steps[0].name, "Device Detection");
        assert_eq!(state.list_reports("trace").expect("list").len(), 1);
    }

    #[test]
    fn rejects_empty_and_oversized_uploads() {
        let dir = TempDir::new().expect("tmp");
        let (state, store) = state(&dir);

        let err = state.submit_archive("a.apk", b"", "trace").expect_err("empty");
        assert_eq!(err.code, ERR_VALIDATION);
        let err = state
            .submit_archive("a.apk", &[0u8; 65], "trace")
            .expect_err("too big");
        assert_eq!(err.code, ERR_VALIDATION);
        assert!(store.list("trace").expect("list").is_empty());
    }

    #[test]
    fn queue_failure_still_returns_running_report() {
        let dir = TempDir::new().expect("tmp");
        let (state, _store) = state(&dir);
        state.shutdown();

        let id = state.submit_archive("a.apk", b"apk", "trace").expect("submit");
        let report = state.get_report(&id, "trace").expect("report");
        assert_eq!(report.status, ReportStatus::Running);
        assert!(report.steps.is_empty());
    }

    #[test]
    fn unknown_report_is_not_found() {
        let dir = TempDir::new().expect("tmp");
        let (state, _store) = state(&dir);
        let err = state.get_report("nope0000", "trace").expect_err("missing");
        assert_eq!(err.code, ERR_NOT_FOUND);
    }

    #[test]
    fn filenames_are_reduced_to_their_last_component() {
        assert_eq!(sanitize_filename("../../etc/evil.apk"), "evil.apk");
        assert_eq!(sanitize_filename("C:\\builds\\app-debug.apk"), "app-debug.apk");
        assert_eq!(sanitize_filename("  "), DEFAULT_FILENAME);
        assert_eq!(sanitize_filename(".."), DEFAULT_FILENAME);
    }

    #[test]
    fn existing_upload_is_never_overwritten() {
        let dir = TempDir::new().expect("tmp");
        let target = dir.path().join("taken.apk");
        fs::write(&target, b"original").expect("seed");
        let written = write_archive(dir.path(), &target, b"replacement", "trace").expect("write");
        assert!(!written);
        assert_eq!(fs::read(&target).expect("read"), b"original");
    }
}
