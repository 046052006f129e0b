use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use crate::app::error::AppError;
use crate::app::models::{Report, ReportListItem, ReportStatus, ReportSummary, RunResult};
use crate::app::store::{already_completed, missing_report, now_timestamp, ReportStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     CREATE TABLE IF NOT EXISTS reports (
       id TEXT PRIMARY KEY,
       created_at TEXT NOT NULL,
       finished_at TEXT,
       status TEXT NOT NULL,
       source_filename TEXT NOT NULL,
       device_json TEXT,
       app_json TEXT,
       total INTEGER NOT NULL DEFAULT 0,
       passed INTEGER NOT NULL DEFAULT 0,
       failed INTEGER NOT NULL DEFAULT 0,
       steps_json TEXT NOT NULL DEFAULT '[]'
     );
     CREATE INDEX IF NOT EXISTS idx_reports_created ON reports(created_at);
    ";

const SELECT_REPORT: &str = "SELECT id, created_at, finished_at, status, source_filename,
            device_json, app_json, total, passed, failed, steps_json
     FROM reports WHERE id = ?1";

const LIST_REPORTS: &str =
    "SELECT id, status, created_at FROM reports ORDER BY created_at DESC, rowid DESC";

/// One connection per operation; WAL lets readers run alongside the completion write.
pub struct SqliteReportStore {
    db_path: PathBuf,
}

impl SqliteReportStore {
    pub fn open(db_path: &Path, trace_id: &str) -> Result<Self, AppError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create report directory: {err}"), trace_id)
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        let connection = store.connect(trace_id)?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|err| db_error("initialize report database", err, trace_id))?;
        info!(trace_id = %trace_id, path = %db_path.display(), "report database ready");
        Ok(store)
    }

    fn connect(&self, trace_id: &str) -> Result<Connection, AppError> {
        let connection = Connection::open(&self.db_path)
            .map_err(|err| db_error("open report database", err, trace_id))?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| db_error("configure report database", err, trace_id))?;
        Ok(connection)
    }
}

impl ReportStore for SqliteReportStore {
    fn create(&self, id: &str, source_filename: &str, trace_id: &str) -> Result<Report, AppError> {
        let report = Report::running(id, source_filename, now_timestamp());
        let connection = self.connect(trace_id)?;
        let inserted = connection.execute(
            "INSERT INTO reports (id, created_at, status, source_filename) VALUES (?1, ?2, ?3, ?4)",
            params![
                report.id,
                report.created_at,
                report.status.as_str(),
                report.source_filename
            ],
        );
        match inserted {
            Ok(_) => Ok(report),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Err(AppError::validation(
                    format!("Report {id} already exists"),
                    trace_id,
                ))
            }
            Err(err) => Err(db_error("insert report", err, trace_id)),
        }
    }

    fn complete(&self, id: &str, result: RunResult, trace_id: &str) -> Result<Report, AppError> {
        let mut connection = self.connect(trace_id)?;
        // Immediate: a racing completion waits for the write lock, then sees a terminal row.
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| db_error("begin report update", err, trace_id))?;
        let current = tx
            .query_row(SELECT_REPORT, params![id], read_row)
            .optional()
            .map_err(|err| db_error("read report", err, trace_id))?
            .ok_or_else(|| missing_report(id, trace_id))?
            .into_report(trace_id)?;
        if current.status != ReportStatus::Running {
            return Err(already_completed(id, trace_id));
        }

        let done = current.completed(result, now_timestamp());
        let steps_json = to_json(&done.steps, trace_id)?;
        let device_json = done
            .device
            .as_ref()
            .map(|device| to_json(device, trace_id))
            .transpose()?;
        let app_json = done.app.as_ref().map(|app| to_json(app, trace_id)).transpose()?;
        tx.execute(
            "UPDATE reports
             SET finished_at = ?2, status = ?3, device_json = ?4, app_json = ?5,
                 total = ?6, passed = ?7, failed = ?8, steps_json = ?9
             WHERE id = ?1",
            params![
                id,
                done.finished_at,
                done.status.as_str(),
                device_json,
                app_json,
                done.summary.total as i64,
                done.summary.passed as i64,
                done.summary.failed as i64,
                steps_json
            ],
        )
        .map_err(|err| db_error("update report", err, trace_id))?;
        tx.commit()
            .map_err(|err| db_error("commit report update", err, trace_id))?;
        Ok(done)
    }

    fn get(&self, id: &str, trace_id: &str) -> Result<Option<Report>, AppError> {
        let connection = self.connect(trace_id)?;
        connection
            .query_row(SELECT_REPORT, params![id], read_row)
            .optional()
            .map_err(|err| db_error("read report", err, trace_id))?
            .map(|row| row.into_report(trace_id))
            .transpose()
    }

    fn list(&self, trace_id: &str) -> Result<Vec<ReportListItem>, AppError> {
        let connection = self.connect(trace_id)?;
        let mut stmt = connection
            .prepare(LIST_REPORTS)
            .map_err(|err| db_error("prepare report list", err, trace_id))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|err| db_error("list reports", err, trace_id))?;

        let mut items = Vec::new();
        for row in rows {
            let (id, status, created_at) =
                row.map_err(|err| db_error("read report row", err, trace_id))?;
            let status = ReportStatus::parse(&status).ok_or_else(|| {
                AppError::system(format!("Report {id} has unknown status {status}"), trace_id)
            })?;
            items.push(ReportListItem {
                id,
                status,
                created_at,
            });
        }
        Ok(items)
    }
}

struct ReportRow {
    id: String,
    created_at: String,
    finished_at: Option<String>,
    status: String,
    source_filename: String,
    device_json: Option<String>,
    app_json: Option<String>,
    total: i64,
    passed: i64,
    failed: i64,
    steps_json: String,
}

impl ReportRow {
    fn into_report(self, trace_id: &str) -> Result<Report, AppError> {
        let id = self.id;
        let corrupt = |what: &str, err: String| {
            AppError::system(format!("Report {id} has unreadable {what}: {err}"), trace_id)
        };
        let status = ReportStatus::parse(&self.status)
            .ok_or_else(|| corrupt("status", self.status.clone()))?;
        let steps = serde_json::from_str(&self.steps_json)
            .map_err(|err| corrupt("steps", err.to_string()))?;
        let device = self
            .device_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|err| corrupt("device", err.to_string()))?;
        let app = self
            .app_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|err| corrupt("app info", err.to_string()))?;
        Ok(Report {
            id: id.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            status,
            source_filename: self.source_filename,
            device,
            app,
            summary: ReportSummary {
                total: self.total.max(0) as usize,
                passed: self.passed.max(0) as usize,
                failed: self.failed.max(0) as usize,
            },
            steps,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ReportRow> {
    Ok(ReportRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: row.get(3)?,
        source_filename: row.get(4)?,
        device_json: row.get(5)?,
        app_json: row.get(6)?,
        total: row.get(7)?,
        passed: row.get(8)?,
        failed: row.get(9)?,
        steps_json: row.get(10)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T, trace_id: &str) -> Result<String, AppError> {
    serde_json::to_string(value)
        .map_err(|err| AppError::system(format!("Failed to encode report: {err}"), trace_id))
}

fn db_error(action: &str, err: rusqlite::Error, trace_id: &str) -> AppError {
    AppError::system(format!("Failed to {action}: {err}"), trace_id)
}
