use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing on stdout.
///
/// - Default level: INFO (DEBUG for this crate), override via RUST_LOG
/// - `LOG_FORMAT=json` switches to one JSON object per line
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lease_migrator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }

    tracing::debug!("Tracing initialized");
}
