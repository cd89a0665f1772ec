//! Evolution cycle command

use anyhow::Context;
use chrono::Utc;
use observer_evolution::evolution::ProposalRecord;
use observer_evolution::{
    CycleReport, EvolutionConfig, EvolutionOrchestrator, EvolutionStore, FeedbackEvent, Scope,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Parse a JSON-lines feedback file, skipping lines that do not parse
pub fn read_feedback(path: &Path) -> anyhow::Result<Vec<FeedbackEvent>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feedback from {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedbackEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping {}:{}: {}", path.display(), index + 1, e),
        }
    }
    Ok(events)
}

/// Handle the run command
pub async fn handle(
    store: Arc<dyn EvolutionStore>,
    scope: Scope,
    config: EvolutionConfig,
    feedback: Option<&Path>,
    cycles: usize,
    follow: bool,
) -> anyhow::Result<()> {
    let mut orchestrator = EvolutionOrchestrator::new(config, scope, store);

    if let Some(path) = feedback {
        let events = read_feedback(path)?;
        let now = Utc::now();
        info!("Loaded {} feedback events from {}", events.len(), path.display());
        for event in events {
            orchestrator.ingest(event, now);
        }
    }

    if follow {
        let shutdown = orchestrator.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
        orchestrator.run().await?;
        return Ok(());
    }

    for _ in 0..cycles {
        let report = orchestrator.run_cycle_at(Utc::now()).await;
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!("Cycle {} ({})", report.id, report.scope);
    if let Some(phase) = report.aborted {
        println!("  Aborted during {}", phase);
        return;
    }
    println!(
        "  Feedback: {} ({} malformed)",
        report.feedback_count, report.malformed
    );
    for status in &report.subsystems {
        println!(
            "  {:<9} {:<8} {:?}",
            status.subsystem.as_str(),
            status.priority.as_str(),
            status.outcome
        );
    }
    for ProposalRecord {
        id,
        target,
        priority,
        outcome,
        ..
    } in &report.proposals
    {
        println!("  proposal {} on {} [{}]: {:?}", id, target, priority, outcome);
    }
    if let Some(health) = &report.health {
        println!(
            "  Health: {:.0}% ({})",
            health.score * 100.0,
            if health.healthy { "healthy" } else { "degraded" }
        );
    }
}
