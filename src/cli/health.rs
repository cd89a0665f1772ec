//! Health check command

use chrono::Utc;
use observer_evolution::health::{self, CheckStatus};
use observer_evolution::{EvolutionConfig, EvolutionStore, Scope};
use std::sync::Arc;

/// Handle the health command
pub async fn handle(
    store: Arc<dyn EvolutionStore>,
    scope: Scope,
    config: EvolutionConfig,
    json: bool,
) -> anyhow::Result<()> {
    let summary = health::assess(store.as_ref(), &scope, &config.health, Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Health of {}: {:.0}%", scope, summary.score * 100.0);
    for check in &summary.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok  ",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "FAIL",
        };
        println!("  [{}] {}: {}", marker, check.name, check.message);
    }
    println!(
        "{} passed, {} warnings, {} failed",
        summary.summary.passed, summary.summary.warnings, summary.summary.errors
    );

    if !summary.healthy {
        std::process::exit(1);
    }
    Ok(())
}
