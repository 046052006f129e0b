use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level when it is set. Logs go to stderr so the
/// smoke CLI can keep stdout for its summary.
pub fn init_logging(default_level: &str) {
    let fallback = if default_level.trim().is_empty() {
        "info"
    } else {
        default_level.trim()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .json()
            .with_target(false)
            .try_init();
    }
}
