//! Route-level tests against an in-memory store and a runner with no devices attached.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::http::header;
use actix_web::{test, web, App};
use serde_json::Value;
use tempfile::TempDir;

use apk_autotest_lib::app::adb::bridge::DeviceBridge;
use apk_autotest_lib::app::adb::runner::CommandOutput;
use apk_autotest_lib::app::api::configure_routes;
use apk_autotest_lib::app::automation::{AutomationDriver, AutomationSession, SessionRequest};
use apk_autotest_lib::app::config::AppConfig;
use apk_autotest_lib::app::error::AppError;
use apk_autotest_lib::app::package::MetadataTool;
use apk_autotest_lib::app::scheduler::TaskScheduler;
use apk_autotest_lib::app::state::AppState;
use apk_autotest_lib::app::steps::{RunSettings, StepRunner};
use apk_autotest_lib::app::store::MemoryReportStore;

const BOUNDARY: &str = "autotest-boundary";

struct EmptyBridge;

impl DeviceBridge for EmptyBridge {
    fn list_devices(&self, _trace_id: &str) -> Result<String, AppError> {
        Ok("List of devices attached\n\n".to_string())
    }

    fn install(&self, _: &str, _: &Path, trace_id: &str) -> Result<CommandOutput, AppError> {
        Err(AppError::system("unexpected install", trace_id))
    }
}

struct UnusedTool;

impl MetadataTool for UnusedTool {
    fn dump_badging(&self, _: &Path, trace_id: &str) -> Result<CommandOutput, AppError> {
        Err(AppError::system("unexpected aapt call", trace_id))
    }
}

struct UnusedDriver;

impl AutomationDriver for UnusedDriver {
    fn open(
        &self,
        _: &SessionRequest,
        trace_id: &str,
    ) -> Result<Box<dyn AutomationSession>, AppError> {
        Err(AppError::system("unexpected session", trace_id))
    }
}

fn app_state(dir: &TempDir) -> Arc<AppState> {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.path().to_string_lossy().to_string();
    config.dispatch.workers = 1;
    let runner = StepRunner::new(
        Arc::new(EmptyBridge),
        Arc::new(UnusedTool),
        Arc::new(UnusedDriver),
        Arc::new(TaskScheduler::new()),
        RunSettings {
            launch_settle: Duration::ZERO,
            ..RunSettings::from_config(&config)
        },
    );
    Arc::new(AppState::new(
        config,
        Arc::new(MemoryReportStore::new()),
        Arc::new(runner),
    ))
}

fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/vnd.android.package-archive\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(field: &str, filename: &str, bytes: &[u8]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/upload-apk")
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body(field, filename, bytes))
}

#[actix_rt::test]
async fn health_reports_running() {
    let dir = TempDir::new().expect("tmp");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(app_state(&dir)))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "AutoTest server is running!");
}

#[actix_rt::test]
async fn uploaded_archive_gets_a_readable_report() {
    let dir = TempDir::new().expect("tmp");
    let state = app_state(&dir);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&state)))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("apk", "notes.apk", b"PK\x03\x04notes").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "success");
    let report_id = body["report_id"].as_str().expect("report id").to_string();
    assert_eq!(report_id.len(), 8);

    let stored = dir.path().join("uploads").join(format!("{report_id}.apk"));
    assert_eq!(std::fs::read(stored).expect("archive"), b"PK\x03\x04notes");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/reports/{report_id}"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let report: Value = test::read_body_json(resp).await;
    assert_eq!(report["id"], report_id.as_str());
    assert_eq!(report["source_filename"], "notes.apk");
    let status = report["status"].as_str().expect("status");
    assert!(status == "RUNNING" || status == "FAILED");

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/reports").to_request()).await;
    assert_eq!(resp.status(), 200);
    let listed: Value = test::read_body_json(resp).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["id"], report_id.as_str());

    state.shutdown();
    let report = state.get_report(&report_id, "trace").expect("report");
    assert_eq!(report.summary.total, 1);
    assert_eq!(report.steps[0].detail, "No device or emulator connected");
}

#[actix_rt::test]
async fn upload_without_apk_field_is_rejected() {
    let dir = TempDir::new().expect("tmp");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(app_state(&dir)))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("file", "notes.apk", b"PK\x03\x04notes").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["report"], "No file received");
}

#[actix_rt::test]
async fn unknown_report_is_not_found() {
    let dir = TempDir::new().expect("tmp");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(app_state(&dir)))
            .configure(configure_routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/reports/zzzz0000")
            .insert_header(("x-trace-id", "trace-404"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "ERR_NOT_FOUND");
    assert_eq!(body["trace_id"], "trace-404");
}
