// 📝 Logging
// tracing subscriber shared by the CLI and the audit server.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Library events plus the audit server binary's own target.
const DEFAULT_DIRECTIVE: &str = "fraud_etl=info,fraud_etl_server=info";

/// Initializes tracing output on stderr; stdout stays free for CLI summaries.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is harmless.
pub fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("logging already initialised");
    }
}
