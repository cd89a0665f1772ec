//! Post-commit health assessment
//!
//! Runs after the COMMITTING phase over the last day of records:
//! - Store reachability
//! - Memory retrieval hit rate
//! - Agent execution success rate
//! - Feedback sentiment
//! - Audit replay integrity
//!
//! A check without data passes.

use crate::audit;
use crate::error::Result;
use crate::evolution::config::HealthConfig;
use crate::evolution::proposal::EvolutionSubsystem;
use crate::storage::EvolutionStore;
use crate::types::{OperationKind, PatternKind, Scope};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LOOKBACK_HOURS: i64 = 24;
const WINDOW_LIMIT: usize = 1000;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Individual health check result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    /// Subsystem whose commits are suspect when this check fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<EvolutionSubsystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Pass, message)
    }

    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Warn, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Fail, message)
    }

    fn with_status(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            subsystem: None,
            details: None,
        }
    }

    pub fn for_subsystem(mut self, subsystem: EvolutionSubsystem) -> Self {
        self.subsystem = Some(subsystem);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Overall health check summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: CheckStatus,
    pub score: f32,
    pub healthy: bool,
    pub checks: Vec<CheckResult>,
    pub summary: HealthStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_checks: usize,
    pub passed: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl HealthSummary {
    fn from_checks(checks: Vec<CheckResult>, threshold: f32) -> Self {
        let passed = checks.iter().filter(|c| c.status == CheckStatus::Pass).count();
        let warnings = checks.iter().filter(|c| c.status == CheckStatus::Warn).count();
        let errors = checks.iter().filter(|c| c.status == CheckStatus::Fail).count();
        let total_checks = checks.len();

        let score = if total_checks == 0 {
            1.0
        } else {
            (passed as f32 + 0.5 * warnings as f32) / total_checks as f32
        };
        let status = if errors > 0 {
            CheckStatus::Fail
        } else if warnings > 0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };

        Self {
            status,
            score,
            healthy: score >= threshold,
            checks,
            summary: HealthStats {
                total_checks,
                passed,
                warnings,
                errors,
            },
        }
    }

    /// Subsystems mapped to failing checks
    pub fn failing_subsystems(&self) -> Vec<EvolutionSubsystem> {
        let mut subsystems: Vec<_> = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .filter_map(|c| c.subsystem)
            .collect();
        subsystems.sort();
        subsystems.dedup();
        subsystems
    }
}

/// Run all health checks for a scope
pub async fn assess(
    store: &dyn EvolutionStore,
    scope: &Scope,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Result<HealthSummary> {
    debug!("Assessing health for {}", scope);
    let since = now - Duration::hours(LOOKBACK_HOURS);

    let mut checks = vec![check_store(store, scope).await];
    checks.push(check_memory_retrieval(store, scope, since, config.threshold).await?);
    checks.push(check_agent_success(store, scope, since, config.min_agent_success_rate).await?);
    checks.push(check_feedback_sentiment(store, scope, since).await?);
    checks.push(check_audit_integrity(store, scope).await?);

    let summary = HealthSummary::from_checks(checks, config.threshold);
    if summary.healthy {
        info!(
            "Health {:.0}% ({} passed, {} warnings, {} failed)",
            summary.score * 100.0,
            summary.summary.passed,
            summary.summary.warnings,
            summary.summary.errors
        );
    } else {
        warn!(
            "Health degraded: {:.0}% (threshold {:.0}%)",
            summary.score * 100.0,
            config.threshold * 100.0
        );
    }
    Ok(summary)
}

async fn check_store(store: &dyn EvolutionStore, scope: &Scope) -> CheckResult {
    match store.list_current(scope).await {
        Ok(entities) => CheckResult::pass("store", format!("{} current entities", entities.len())),
        Err(e) => CheckResult::fail("store", format!("Store unavailable: {}", e)),
    }
}

async fn check_memory_retrieval(
    store: &dyn EvolutionStore,
    scope: &Scope,
    since: DateTime<Utc>,
    threshold: f32,
) -> Result<CheckResult> {
    let ops = store.read_operations(scope, since, WINDOW_LIMIT).await?;
    let accesses: Vec<_> = ops.iter().filter(|op| op.kind == OperationKind::Access).collect();
    if accesses.is_empty() {
        return Ok(CheckResult::pass("memory_retrieval", "No retrievals in window"));
    }

    let hits = accesses.iter().filter(|op| op.success).count();
    let rate = hits as f32 / accesses.len() as f32;
    let details = serde_json::json!({ "accesses": accesses.len(), "hits": hits, "rate": rate });
    let result = if rate >= threshold {
        CheckResult::pass("memory_retrieval", format!("Hit rate {:.0}%", rate * 100.0))
    } else {
        CheckResult::fail("memory_retrieval", format!("Hit rate {:.0}%", rate * 100.0))
    };
    Ok(result
        .for_subsystem(EvolutionSubsystem::Memory)
        .with_details(details))
}

async fn check_agent_success(
    store: &dyn EvolutionStore,
    scope: &Scope,
    since: DateTime<Utc>,
    min_rate: f32,
) -> Result<CheckResult> {
    let logs = store.read_agent_logs(scope, since, WINDOW_LIMIT).await?;
    let runs: Vec<bool> = logs.iter().filter_map(|l| l.execution_success()).collect();
    if runs.is_empty() {
        return Ok(CheckResult::pass("agent_success_rate", "No agent runs in window"));
    }

    let rate = runs.iter().filter(|s| **s).count() as f32 / runs.len() as f32;
    let details = serde_json::json!({ "runs": runs.len(), "rate": rate });
    let result = if rate >= min_rate {
        CheckResult::pass("agent_success_rate", format!("Success rate {:.0}%", rate * 100.0))
    } else {
        CheckResult::fail(
            "agent_success_rate",
            format!("Success rate {:.0}% below {:.0}%", rate * 100.0, min_rate * 100.0),
        )
    };
    Ok(result
        .for_subsystem(EvolutionSubsystem::Agents)
        .with_details(details))
}

async fn check_feedback_sentiment(
    store: &dyn EvolutionStore,
    scope: &Scope,
    since: DateTime<Utc>,
) -> Result<CheckResult> {
    let patterns = store.read_patterns(scope, since, WINDOW_LIMIT).await?;
    let support = |kind: PatternKind| -> u32 {
        patterns
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.support)
            .sum()
    };
    let positive = support(PatternKind::PositiveFeedback);
    let negative = support(PatternKind::NegativeFeedback);

    let result = if negative > positive {
        CheckResult::warn(
            "feedback_sentiment",
            format!("{} negative vs {} positive signals", negative, positive),
        )
    } else {
        CheckResult::pass(
            "feedback_sentiment",
            format!("{} positive vs {} negative signals", positive, negative),
        )
    };
    Ok(result.for_subsystem(EvolutionSubsystem::Behavior))
}

async fn check_audit_integrity(store: &dyn EvolutionStore, scope: &Scope) -> Result<CheckResult> {
    let entities = store.list_current(scope).await?;
    let mut broken = Vec::new();
    for entity in &entities {
        let key = entity.value.key();
        match audit::verify(store, scope, &key).await {
            Ok(true) => {}
            Ok(false) => broken.push(key.to_string()),
            Err(e) => {
                warn!("Audit replay failed for {}: {}", key, e);
                broken.push(key.to_string());
            }
        }
    }

    if broken.is_empty() {
        Ok(CheckResult::pass(
            "audit_integrity",
            format!("{} entities replay to their current version", entities.len()),
        ))
    } else {
        Ok(CheckResult::fail(
            "audit_integrity",
            format!("Audit does not reproduce: {}", broken.join(", ")),
        )
        .with_details(serde_json::json!({ "entities": broken })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::types::{AgentId, AgentLog, MemoryOperation};

    #[tokio::test]
    async fn test_empty_store_is_healthy() {
        let store = InMemoryStore::new();
        let summary = assess(&store, &Scope::default(), &HealthConfig::default(), Utc::now())
            .await
            .unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.status, CheckStatus::Pass);
        assert_eq!(summary.summary.total_checks, 5);
    }

    #[tokio::test]
    async fn test_failing_runs_map_to_agents() {
        let store = InMemoryStore::new();
        let scope = Scope::default();
        let now = Utc::now();
        let agent = AgentId::new();
        for i in 0..10 {
            let log = AgentLog::execution(agent, scope.clone(), i < 3, "run", now - Duration::minutes(i));
            store.append_agent_log(&log).await.unwrap();
        }

        let summary = assess(&store, &scope, &HealthConfig::default(), now).await.unwrap();
        assert_eq!(summary.status, CheckStatus::Fail);
        assert_eq!(summary.failing_subsystems(), vec![EvolutionSubsystem::Agents]);
        assert!((summary.score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missed_retrievals_map_to_memory() {
        let store = InMemoryStore::new();
        let scope = Scope::default();
        let now = Utc::now();
        for i in 0..4 {
            let mut op = MemoryOperation::new(scope.clone(), OperationKind::Access, Vec::new(), now);
            op.success = i == 0;
            store.append_operation(&op).await.unwrap();
        }

        let config = HealthConfig {
            threshold: 0.9,
            ..HealthConfig::default()
        };
        let summary = assess(&store, &scope, &config, now).await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.failing_subsystems(), vec![EvolutionSubsystem::Memory]);
    }
}
