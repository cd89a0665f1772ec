//! Rollback command

use observer_evolution::{EntityKey, EvolutionConfig, EvolutionOrchestrator, EvolutionStore, Scope};
use std::sync::Arc;

/// Handle the rollback command
pub async fn handle(
    store: Arc<dyn EvolutionStore>,
    scope: Scope,
    target: &str,
    reason: &str,
) -> anyhow::Result<()> {
    let key: EntityKey = target.parse()?;
    let orchestrator = EvolutionOrchestrator::new(EvolutionConfig::default(), scope, store);
    let version = orchestrator.rollback(&key, reason).await?;
    println!("Rolled back {} (now v{})", key, version);
    Ok(())
}
