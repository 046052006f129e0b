use std::fs;
use std::path::{Path, PathBuf};

use apk_autotest_lib::app::config::load_config;
use apk_autotest_lib::app::logging::init_logging;
use apk_autotest_lib::app::models::{Report, ReportStatus};
use apk_autotest_lib::app::state::build_runner;
use apk_autotest_lib::app::store::{new_report_id, MemoryReportStore, ReportStore};
use serde::Serialize;
use uuid::Uuid;

const TOOL: &str = "apk_autotest_smoke";

#[derive(Debug, Clone)]
struct Args {
    apk_path: PathBuf,
    out_dir: Option<PathBuf>,
    json: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    out_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<Report>,
}

fn parse_args() -> Result<Args, String> {
    let mut apk_path: Option<PathBuf> = None;
    let mut out_dir: Option<PathBuf> = None;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--apk" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--apk requires a value".to_string())?;
                apk_path = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- --apk PATH [--out DIR] [--json]\n".to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    let apk_path = apk_path.ok_or_else(|| "--apk is required".to_string())?;
    Ok(Args {
        apk_path,
        out_dir,
        json,
    })
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn run(args: &Args, out_dir: &Path, trace_id: &str) -> Result<Report, String> {
    if !args.apk_path.is_file() {
        return Err(format!("APK not found: {}", args.apk_path.display()));
    }
    let config = load_config(trace_id).map_err(|err| err.to_string())?;
    init_logging(&config.logging.level);

    let runner = build_runner(&config, trace_id).map_err(|err| err.to_string())?;
    let store = MemoryReportStore::new();
    let report_id = new_report_id();
    let filename = args
        .apk_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.apk".to_string());
    store
        .create(&report_id, &filename, trace_id)
        .map_err(|err| err.to_string())?;

    let result = runner.run(&args.apk_path, &out_dir.join("screenshots"), trace_id);
    store
        .complete(&report_id, result, trace_id)
        .map_err(|err| err.to_string())
}

fn print_text(summary: &SmokeSummary) {
    println!(
        "status: {}\ntrace_id: {}\nout: {}",
        summary.status, summary.trace_id, summary.out_dir
    );
    if let Some(error) = &summary.error {
        println!("error: {error}");
    }
    if let Some(report) = &summary.report {
        for step in &report.steps {
            println!("  [{:?}] {}: {}", step.status, step.name, step.detail);
        }
        println!(
            "summary: {} total, {} passed, {} failed",
            report.summary.total, report.summary.passed, report.summary.failed
        );
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();

    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("apk_autotest_smoke_{trace_id}"));
        p
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let (status, error, report) = match run(&args, &out_dir, &trace_id) {
        Ok(report) if report.status == ReportStatus::Passed => ("pass", None, Some(report)),
        Ok(report) => ("fail", None, Some(report)),
        Err(err) => ("fail", Some(err), None),
    };
    let summary = SmokeSummary {
        tool: TOOL,
        status,
        trace_id,
        out_dir: out_dir.to_string_lossy().to_string(),
        error,
        report,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        print_text(&summary);
    }
    if summary.status != "pass" {
        std::process::exit(1);
    }
}
