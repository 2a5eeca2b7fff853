//! Election portal core
//!
//! Location-scoped ballot eligibility, exactly-once ballot submission,
//! partitioned vote tallies and a realtime feed for monitor dashboards.

pub mod config;
pub mod eligibility;
pub mod errors;
pub mod feed;
pub mod location;
pub mod monitor;
pub mod notify;
pub mod portal;
pub mod reconcile;
pub mod reference;
pub mod session;
pub mod store;
pub mod submission;
pub mod tally;
pub mod types;

// Re-export commonly used types
pub use errors::{Error, Result};
pub use portal::ElectionPortal;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG`, defaulting to `ballot=info`
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ballot=info".into()),
        )
        .try_init()
        .map_err(|e| Error::internal(format!("logging already initialized: {e}")))?;

    tracing::info!("🗳️  Election portal v{} initialized", VERSION);
    Ok(())
}

/// Initialize logging with an explicit level and format
pub fn init_with(logging: &config::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .map_err(|_| Error::validation("LOG_LEVEL"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match logging.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| Error::internal(format!("logging already initialized: {e}")))?;

    tracing::info!(
        "🗳️  Election portal v{} initialized ({} logs)",
        VERSION,
        logging.format
    );
    Ok(())
}
