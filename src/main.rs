//! isxflow - Iraq Stock Exchange daily-report pipeline.
//!
//! Orchestrates scraping, processing, index extraction and analysis of ISX
//! daily trading reports, with a local dashboard streaming live progress.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if isxflow::cli::is_verbose() {
        "isxflow=info"
    } else {
        "isxflow=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    isxflow::cli::run().await
}
