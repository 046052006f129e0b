//! HTTP routes over [`AppState`]. Store and filesystem work runs on actix's blocking pool.

use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{get, post, web, HttpRequest, HttpResponse, ResponseError};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::error::{AppError, ERR_DEPENDENCY, ERR_NOT_FOUND, ERR_VALIDATION};
use crate::app::state::AppState;

pub const UPLOAD_FIELD: &str = "apk";
pub const TRACE_HEADER: &str = "x-trace-id";
const HEALTH_MESSAGE: &str = "AutoTest server is running!";
const DEFAULT_UPLOAD_NAME: &str = "upload.apk";

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self.code.as_str() {
            ERR_VALIDATION => StatusCode::BAD_REQUEST,
            ERR_NOT_FOUND => StatusCode::NOT_FOUND,
            ERR_DEPENDENCY => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            warn!(
                trace_id = %self.trace_id,
                code = %self.code,
                error = %self.error,
                "request failed"
            );
        }
        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "report": self.error,
            "code": self.code,
            "trace_id": self.trace_id,
        }))
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(upload_apk)
        .service(list_reports)
        .service(get_report);
}

/// Caller-supplied trace id, or a fresh one.
fn resolve_trace_id(req: &HttpRequest) -> String {
    req.headers()
        .get(TRACE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn blocking_error(err: actix_web::error::BlockingError, trace_id: &str) -> AppError {
    AppError::system(format!("Background task failed: {err}"), trace_id)
}

#[get("/")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": HEALTH_MESSAGE }))
}

#[post("/upload-apk")]
pub async fn upload_apk(
    req: HttpRequest,
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let trace_id = resolve_trace_id(&req);
    let max_bytes = state.config.server.max_upload_bytes;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|err| {
            AppError::validation(format!("Multipart error: {err}"), &trace_id)
        })?;
        let disposition = field.content_disposition();
        let is_apk = disposition.and_then(|cd| cd.get_name()) == Some(UPLOAD_FIELD);
        let filename = disposition
            .and_then(|cd| cd.get_filename())
            .unwrap_or(DEFAULT_UPLOAD_NAME)
            .to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk
                .map_err(|err| AppError::validation(format!("Read error: {err}"), &trace_id))?;
            if !is_apk || upload.is_some() {
                continue;
            }
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::validation(
                    format!("Uploaded file exceeds {max_bytes} bytes"),
                    &trace_id,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        if is_apk && upload.is_none() {
            upload = Some((filename, bytes));
        }
    }

    let Some((filename, bytes)) = upload else {
        return Ok(HttpResponse::BadRequest().json(json!({
            "status": "error",
            "report": "No file received",
        })));
    };
    info!(trace_id = %trace_id, filename = %filename, bytes = bytes.len(), "archive uploaded");

    let worker_state = state.clone();
    let worker_trace = trace_id.clone();
    let report_id = web::block(move || {
        worker_state.submit_archive(&filename, &bytes, &worker_trace)
    })
    .await
    .map_err(|err| blocking_error(err, &trace_id))??;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "report": format!("APK received; test run {report_id} started"),
        "report_id": report_id,
    })))
}

#[get("/reports")]
pub async fn list_reports(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let trace_id = resolve_trace_id(&req);
    let worker_trace = trace_id.clone();
    let items = web::block(move || state.list_reports(&worker_trace))
        .await
        .map_err(|err| blocking_error(err, &trace_id))??;
    Ok(HttpResponse::Ok().json(items))
}

#[get("/reports/{id}")]
pub async fn get_report(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let trace_id = resolve_trace_id(&req);
    let id = path.into_inner();
    let worker_trace = trace_id.clone();
    let report = web::block(move || state.get_report(&id, &worker_trace))
        .await
        .map_err(|err| blocking_error(err, &trace_id))??;
    Ok(HttpResponse::Ok().json(report))
}
