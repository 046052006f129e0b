//! Persisted report records.
//!
//! A record is written twice: once as RUNNING when the archive is accepted, and once
//! more with the full outcome when the run ends. Readers see one of those two states.

pub mod memory;
pub mod sqlite;

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::models::{Report, ReportListItem, RunResult};

pub use memory::MemoryReportStore;
pub use sqlite::SqliteReportStore;

pub const REPORT_ID_LEN: usize = 8;

pub trait ReportStore: Send + Sync {
    /// Inserts a RUNNING record; fails if the id is taken.
    fn create(&self, id: &str, source_filename: &str, trace_id: &str) -> Result<Report, AppError>;

    /// Replaces a RUNNING record with its terminal form in one write.
    fn complete(&self, id: &str, result: RunResult, trace_id: &str) -> Result<Report, AppError>;

    fn get(&self, id: &str, trace_id: &str) -> Result<Option<Report>, AppError>;

    /// Newest first.
    fn list(&self, trace_id: &str) -> Result<Vec<ReportListItem>, AppError>;
}

pub fn new_report_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(REPORT_ID_LEN);
    id
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn already_completed(id: &str, trace_id: &str) -> AppError {
    AppError::validation(format!("Report {id} is already complete"), trace_id)
}

fn missing_report(id: &str, trace_id: &str) -> AppError {
    AppError::not_found(format!("Report {id} not found"), trace_id)
}
