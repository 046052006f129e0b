use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::app::error::AppError;
use crate::app::models::{Report, ReportListItem, ReportStatus, RunResult};
use crate::app::store::{already_completed, missing_report, now_timestamp, ReportStore};

#[derive(Default)]
struct Records {
    next_seq: u64,
    reports: HashMap<String, (u64, Report)>,
}

/// Whole-record replacement under a lock; nothing survives the process.
#[derive(Default)]
pub struct MemoryReportStore {
    records: RwLock<Records>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ReportStore for MemoryReportStore {
    fn create(&self, id: &str, source_filename: &str, trace_id: &str) -> Result<Report, AppError> {
        let mut records = self.write();
        if records.reports.contains_key(id) {
            return Err(AppError::validation(
                format!("Report {id} already exists"),
                trace_id,
            ));
        }
        let report = Report::running(id, source_filename, now_timestamp());
        let seq = records.next_seq;
        records.next_seq += 1;
        records
            .reports
            .insert(id.to_string(), (seq, report.clone()));
        Ok(report)
    }

    fn complete(&self, id: &str, result: RunResult, trace_id: &str) -> Result<Report, AppError> {
        let mut records = self.write();
        let (_, current) = records
            .reports
            .get_mut(id)
            .ok_or_else(|| missing_report(id, trace_id))?;
        if current.status != ReportStatus::Running {
            return Err(already_completed(id, trace_id));
        }
        let done = current.completed(result, now_timestamp());
        *current = done.clone();
        Ok(done)
    }

    fn get(&self, id: &str, _trace_id: &str) -> Result<Option<Report>, AppError> {
        Ok(self.read().reports.get(id).map(|(_, report)| report.clone()))
    }

    fn list(&self, _trace_id: &str) -> Result<Vec<ReportListItem>, AppError> {
        let records = self.read();
        let mut entries: Vec<&(u64, Report)> = records.reports.values().collect();
        entries.sort_by(|(left_seq, left), (right_seq, right)| {
            right
                .created_at
                .cmp(&left.created_at)
                .then(right_seq.cmp(left_seq))
        });
        Ok(entries
            .into_iter()
            .map(|(_, report)| report.list_item())
            .collect())
    }
}
