use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::{error, info};
use uuid::Uuid;

use apk_autotest_lib::app::api::configure_routes;
use apk_autotest_lib::app::config::load_config;
use apk_autotest_lib::app::logging::init_logging;
use apk_autotest_lib::app::state::AppState;

// Sync on purpose: the automation client is a blocking reqwest client and must be
// built before the actix runtime starts.
fn main() -> std::io::Result<()> {
    let trace_id = Uuid::new_v4().to_string();
    let config = match load_config(&trace_id) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!(trace_id = %trace_id, error = %err, "failed to load config");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.level);

    let bind_address = config.bind_address();
    let state = match AppState::from_config(config, &trace_id) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(trace_id = %trace_id, error = %err, "failed to start");
            std::process::exit(1);
        }
    };
    info!(
        trace_id = %trace_id,
        address = %bind_address,
        data_dir = %state.config.data_dir().display(),
        automation = %state.config.automation.endpoint_url,
        workers = state.config.dispatch.workers,
        "starting AutoTest server"
    );

    let data = web::Data::from(Arc::clone(&state));
    let served = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .configure(configure_routes)
        })
        .bind(&bind_address)?
        .run()
        .await
    });

    state.shutdown();
    info!(trace_id = %trace_id, "server stopped");
    served
}
