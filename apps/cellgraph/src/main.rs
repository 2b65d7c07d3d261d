//! # cellgraph
//!
//! Operator binary for cellgraph stores.
//!
//! ## Usage
//!
//! ```bash
//! # Build and invalidate the demo chain
//! cellgraph -D cells.redb demo --value 6
//!
//! # Inspect records
//! cellgraph -D cells.redb show demo name=E
//! cellgraph -D cells.redb show demo name=E --as-of 1700000000000000
//! cellgraph -D cells.redb history demo name=E
//! cellgraph -D cells.redb delete demo name=E
//!
//! # Render a filter
//! cellgraph filter name=E region=eu
//! ```

use cellgraph::cli;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // CELLGRAPH_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("CELLGRAPH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cellgraph=info,cellgraph_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
