//! Version history command

use anyhow::Context;
use observer_evolution::{EntityKey, EvolutionStore, Scope};
use std::sync::Arc;

/// Handle the history command
pub async fn handle(
    store: Arc<dyn EvolutionStore>,
    scope: Scope,
    target: &str,
    json: bool,
) -> anyhow::Result<()> {
    let key: EntityKey = target.parse()?;
    let versions = store
        .history(&scope, &key)
        .await
        .with_context(|| format!("Failed to read history of {}", key))?;
    let records = store.read_audit(&scope, &key).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if versions.is_empty() {
        println!("No versions of {} in {}", key, scope);
        return Ok(());
    }

    println!("{} history in {} ({} versions):", key, scope, versions.len());
    for version in &versions {
        let record = records.iter().find(|r| r.version == version.version);
        let proposal = record
            .and_then(|r| r.proposal_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let evidence = record
            .map(|r| {
                r.evidence.feedback.len()
                    + r.evidence.operations.len()
                    + r.evidence.agent_logs.len()
                    + r.evidence.patterns.len()
            })
            .unwrap_or(0);
        println!(
            "  v{:<4} {}  proposal {}  {} evidence records",
            version.version,
            version.committed_at.format("%Y-%m-%d %H:%M:%S"),
            proposal,
            evidence
        );
    }
    Ok(())
}
