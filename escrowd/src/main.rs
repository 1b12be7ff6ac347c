//! Escrow Workflow Daemon
//!
//! Runtime orchestrator for agreement lifecycle, ledger reconciliation, and API server.
//!
//! # Usage
//!
//! ```bash
//! # Start against the in-process stub ledger
//! ESCROW_ENV=test cargo run -p escrowd
//!
//! # Start against the REST ledger gateway
//! ESCROW_GATEWAY_URL=https://gateway.example ESCROW_GATEWAY_API_KEY=... cargo run -p escrowd
//! ```
//!
//! # Environment Variables
//!
//! - `ESCROW_ENV`: Environment (test, development, production)
//! - `ESCROW_API_HOST`: API host (default: 0.0.0.0)
//! - `ESCROW_API_PORT`: API port (default: 8080)
//! - `ESCROW_GATEWAY_URL`: Ledger gateway base URL
//! - `ESCROW_CONFIRM_TIMEOUT_SECS`: Primary receipt wait (default: 60)
//! - `ESCROW_RECONCILE_GRACE_SECS`: Marker age before reconciliation (default: 120)
//! - `ESCROW_IDENTITY_BINDINGS`: `user=address` pairs, comma separated
//! - `ESCROW_LOG_JSON`: Emit JSON logs when `true`
//! - `DATABASE_URL`: PostgreSQL mirror store (requires the `postgres` feature)

use std::sync::Arc;

use escrowd::{Config, Daemon, Environment};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("escrowd=info".parse()?);
    let json = std::env::var("ESCROW_LOG_JSON").is_ok_and(|v| v == "true");
    if json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        gateway_url = %config.gateway.url,
        "Escrow Workflow Daemon"
    );

    if config.environment == Environment::Test {
        Daemon::new_stub(config).run().await?;
        return Ok(());
    }

    #[cfg(feature = "postgres")]
    {
        let database_url = std::env::var("DATABASE_URL")?;
        let store = escrow_store::PgStore::connect(&database_url).await?;
        store.migrate().await?;
        Daemon::new_gateway(config, Arc::new(store)).run().await?;
    }

    #[cfg(not(feature = "postgres"))]
    {
        Daemon::new_gateway(config, Arc::new(escrow_store::MemoryStore::new()))
            .run()
            .await?;
    }

    Ok(())
}
