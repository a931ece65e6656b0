//! Seller ledger service binary
//!
//! Opens the ledger, audits every account and waits for shutdown.

use anyhow::Context;
use seller_ledger::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting seller ledger");

    // Load configuration
    let config = match std::env::var("SELLER_LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => Config::from_env().context("failed to load config from environment")?,
    };

    // Open ledger
    let ledger = Ledger::open(config).await.context("failed to open ledger")?;

    let reports = ledger.audit_all().context("startup audit failed")?;
    for report in reports.iter().filter(|r| !r.is_clean()) {
        tracing::error!(
            account = %report.account,
            violations = report.violations.len(),
            "Account failed startup audit"
        );
    }

    let stats = ledger.get_stats()?;
    tracing::info!(stats = %serde_json::to_string(&stats)?, "Ledger opened successfully");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down seller ledger");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let json = std::env::var("SELLER_LEDGER_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
