use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::app::error::AppError;
use crate::app::models::{FailureKind, RunResult, StepOutcome};
use crate::app::steps::{StepRunner, STEP_TEST_RUN};
use crate::app::store::ReportStore;

pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJob {
    pub report_id: String,
    pub archive_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub trace_id: String,
}

/// Bounded worker pool fed by one queue. Each job ends with exactly one `complete` call.
pub struct Dispatcher {
    sender: Mutex<Option<Sender<RunJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(runner: Arc<StepRunner>, store: Arc<dyn ReportStore>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<RunJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let count = workers.clamp(1, MAX_WORKERS);
        let handles = (0..count)
            .map(|index| {
                let runner = Arc::clone(&runner);
                let store = Arc::clone(&store);
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("run-worker-{index}"))
                    .spawn(move || worker_loop(index, &receiver, &runner, store.as_ref()))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "failed to spawn run worker");
                    None
                }
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "run dispatcher started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    pub fn submit(&self, job: RunJob) -> Result<(), AppError> {
        let trace_id = job.trace_id.clone();
        let report_id = job.report_id.clone();
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = guard
            .as_ref()
            .ok_or_else(|| AppError::system("Run dispatcher is shut down", &trace_id))?;
        sender
            .send(job)
            .map_err(|_| AppError::system("Run dispatcher has no workers", &trace_id))?;
        info!(trace_id = %trace_id, report_id = %report_id, "run queued");
        Ok(())
    }

    /// Stops accepting jobs, lets the workers drain the queue, then joins them.
    pub fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_none() {
            return;
        }
        drop(sender);
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("run worker exited with a panic");
            }
        }
        info!("run dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    receiver: &Mutex<Receiver<RunJob>>,
    runner: &StepRunner,
    store: &dyn ReportStore,
) {
    loop {
        let next = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(poisoned) => poisoned.into_inner().recv(),
        };
        let Ok(job) = next else {
            break;
        };
        info!(
            trace_id = %job.trace_id,
            report_id = %job.report_id,
            worker = index,
            "run started"
        );
        let result = catch_unwind(AssertUnwindSafe(|| {
            runner.run(&job.archive_path, &job.artifacts_dir, &job.trace_id)
        }))
        .unwrap_or_else(|_| internal_failure());

        let failed = result.steps.iter().filter(|step| step.is_failed()).count();
        match store.complete(&job.report_id, result, &job.trace_id) {
            Ok(report) => info!(
                trace_id = %job.trace_id,
                report_id = %job.report_id,
                status = report.status.as_str(),
                total = report.summary.total,
                failed,
                "run finished"
            ),
            Err(err) => error!(
                trace_id = %job.trace_id,
                report_id = %job.report_id,
                error = %err,
                "failed to record run result; report stays RUNNING"
            ),
        }
    }
}

fn internal_failure() -> RunResult {
    RunResult {
        steps: vec![StepOutcome::failed(
            STEP_TEST_RUN,
            FailureKind::Internal,
            "Internal error: test run aborted",
        )],
        ..RunResult::default()
    }
}
