//! Memory evolution
//!
//! Tunes the memory-management policy ([`MemoryParams`]) from the access
//! patterns and operation history of a bounded window. Evaluation is pure;
//! the orchestrator commits accepted proposals through [`MemoryEvolution::commit_for`].

use crate::audit::Evidence;
use crate::error::{EvolutionError, Result};
use crate::evolution::agent::{Adjustment, AgentField, Recommendation};
use crate::evolution::config::MemoryEvolutionConfig;
use crate::evolution::proposal::{EvolutionPriority, EvolutionSubsystem, ParamChange, ProposedChange};
use crate::storage::{AuditEntry, Commit, OwnedEntity};
use crate::types::{FactId, MemoryFact, MemoryOperation, OperationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const DECAY_BOUNDS: (f32, f32) = (0.5, 0.99);
const IMPORTANCE_BOUNDS: (f32, f32) = (0.1, 0.9);
const LINK_BOUNDS: (f32, f32) = (0.5, 0.95);
const CONSOLIDATION_BOUNDS: (f32, f32) = (0.5, 0.99);
const RETENTION_BOUNDS: (f32, f32) = (1.0, 365.0);
const TOP_K_BOUNDS: (u32, u32) = (5, 50);

const DECAY_STEP: f32 = 0.02;
const THRESHOLD_STEP: f32 = 0.05;
const RETENTION_SHRINK: f32 = 0.8;
const RETENTION_GROW: f32 = 1.25;
const TOP_K_STEP: u32 = 5;

/// Tunable memory policy; one current version per scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryParams {
    /// Daily decay multiplier for facts (lower decays faster)
    pub decay_rate_facts: f32,
    pub decay_rate_beliefs: f32,
    pub decay_rate_experiences: f32,
    /// Minimum effective weight for a fact to be kept
    pub importance_threshold: f32,
    pub link_similarity_threshold: f32,
    /// Similarity above which duplicate facts are merged
    pub consolidation_threshold: f32,
    pub retention_window_days: f32,
    pub retrieval_top_k: u32,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            decay_rate_facts: 0.95,
            decay_rate_beliefs: 0.90,
            decay_rate_experiences: 0.85,
            importance_threshold: 0.5,
            link_similarity_threshold: 0.75,
            consolidation_threshold: 0.85,
            retention_window_days: 30.0,
            retrieval_top_k: 10,
        }
    }
}

fn clamp((lo, hi): (f32, f32), value: f32) -> f32 {
    value.clamp(lo, hi)
}

/// Round to three decimals so repeated steps do not accumulate float noise
fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

impl MemoryParams {
    /// Check every value against its bounds
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("decay_rate_facts", self.decay_rate_facts, DECAY_BOUNDS),
            ("decay_rate_beliefs", self.decay_rate_beliefs, DECAY_BOUNDS),
            ("decay_rate_experiences", self.decay_rate_experiences, DECAY_BOUNDS),
            ("importance_threshold", self.importance_threshold, IMPORTANCE_BOUNDS),
            ("link_similarity_threshold", self.link_similarity_threshold, LINK_BOUNDS),
            ("consolidation_threshold", self.consolidation_threshold, CONSOLIDATION_BOUNDS),
            ("retention_window_days", self.retention_window_days, RETENTION_BOUNDS),
        ];
        for (name, value, (lo, hi)) in checks {
            if !(lo..=hi).contains(&value) {
                return Err(EvolutionError::InvalidParameter {
                    name: name.to_string(),
                    reason: format!("{} outside [{}, {}]", value, lo, hi),
                });
            }
        }
        if !(TOP_K_BOUNDS.0..=TOP_K_BOUNDS.1).contains(&self.retrieval_top_k) {
            return Err(EvolutionError::InvalidParameter {
                name: "retrieval_top_k".to_string(),
                reason: format!(
                    "{} outside [{}, {}]",
                    self.retrieval_top_k, TOP_K_BOUNDS.0, TOP_K_BOUNDS.1
                ),
            });
        }
        Ok(())
    }

    fn as_pairs(&self) -> [(&'static str, f64); 8] {
        [
            ("decay_rate_facts", self.decay_rate_facts as f64),
            ("decay_rate_beliefs", self.decay_rate_beliefs as f64),
            ("decay_rate_experiences", self.decay_rate_experiences as f64),
            ("importance_threshold", self.importance_threshold as f64),
            ("link_similarity_threshold", self.link_similarity_threshold as f64),
            ("consolidation_threshold", self.consolidation_threshold as f64),
            ("retention_window_days", self.retention_window_days as f64),
            ("retrieval_top_k", self.retrieval_top_k as f64),
        ]
    }

    /// Parameters that differ between two versions
    pub fn diff(&self, next: &MemoryParams, reason: &str) -> Vec<ParamChange> {
        self.as_pairs()
            .into_iter()
            .zip(next.as_pairs())
            .filter(|((_, a), (_, b))| (a - b).abs() > f64::EPSILON)
            .map(|((name, a), (_, b))| ParamChange::new(name, a, b, reason))
            .collect()
    }
}

/// Aggregate statistics over one evaluation window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub facts: usize,
    pub active_facts: usize,
    pub operations: usize,
    pub accesses: usize,
    /// Accesses per active fact
    pub access_frequency: f32,
    pub decay_candidates: usize,
    pub decay_ratio: f32,
    /// Accesses that failed or hit forgotten facts
    pub miss_ratio: f32,
    pub merge_candidates: usize,
    pub merge_ratio: f32,
    pub low_confidence_ratio: f32,
}

/// New memory params proposed from a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedParams {
    pub params: MemoryParams,
    pub changes: Vec<ParamChange>,
    pub stats: WindowStats,
}

impl ProposedParams {
    /// Agent-level recommendations implied by this proposal
    pub fn recommendations(
        &self,
        priority: EvolutionPriority,
        proposal: &ProposedChange,
    ) -> Vec<Recommendation> {
        let mut recs = Vec::new();
        for change in &self.changes {
            let (field, adjustment) = match change.name.as_str() {
                "retention_window_days" => (AgentField::RetentionDays, Adjustment::Set(change.to)),
                "decay_rate_facts" => (AgentField::DecayRate, Adjustment::Set(change.to)),
                "importance_threshold" => {
                    (AgentField::ConfidenceThreshold, Adjustment::Shift(change.delta()))
                }
                _ => continue,
            };
            recs.push(
                Recommendation::new(
                    EvolutionSubsystem::Memory,
                    priority,
                    field,
                    adjustment,
                    change.reason.clone(),
                    proposal.created_at,
                )
                .with_proposal(proposal.id),
            );
        }
        recs
    }
}

/// Memory evolution subsystem
pub struct MemoryEvolution {
    config: MemoryEvolutionConfig,
}

impl MemoryEvolution {
    pub fn new(config: MemoryEvolutionConfig) -> Self {
        Self { config }
    }

    /// Operations that act on facts; commit audit entries are excluded
    fn fact_operations(operations: &[MemoryOperation]) -> impl Iterator<Item = &MemoryOperation> {
        operations
            .iter()
            .filter(|op| !matches!(op.kind, OperationKind::Tune | OperationKind::Rollback))
    }

    /// Compute window statistics against the current policy
    pub fn window_stats(
        &self,
        facts: &[MemoryFact],
        operations: &[MemoryOperation],
        current: &MemoryParams,
        now: DateTime<Utc>,
    ) -> WindowStats {
        let by_id: HashMap<FactId, &MemoryFact> = facts.iter().map(|f| (f.id, f)).collect();
        let ops: Vec<&MemoryOperation> = Self::fact_operations(operations).collect();
        let accesses: Vec<&MemoryOperation> = ops
            .iter()
            .copied()
            .filter(|op| op.kind == OperationKind::Access)
            .collect();
        let accessed: HashSet<FactId> = accesses.iter().flat_map(|op| op.fact_ids.iter().copied()).collect();

        let active: Vec<&MemoryFact> = facts.iter().filter(|f| !f.is_forgotten()).collect();
        let decay_candidates = active
            .iter()
            .filter(|f| !accessed.contains(&f.id))
            .filter(|f| f.effective_weight(current.decay_rate_facts, now) < current.importance_threshold)
            .count();

        let misses = accesses
            .iter()
            .filter(|op| {
                !op.success
                    || op
                        .fact_ids
                        .iter()
                        .any(|id| by_id.get(id).map(|f| f.is_forgotten()).unwrap_or(false))
            })
            .count();

        let mut seen = HashSet::new();
        let merge_candidates = active
            .iter()
            .filter(|f| !seen.insert(f.normalized_content()))
            .count();

        let rated: Vec<f32> = ops.iter().filter_map(|op| op.confidence).collect();
        let low_confidence = rated
            .iter()
            .filter(|c| **c < self.config.low_confidence_cutoff)
            .count();

        let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f32 / d as f32 };
        WindowStats {
            facts: facts.len(),
            active_facts: active.len(),
            operations: ops.len(),
            accesses: accesses.len(),
            access_frequency: ratio(accesses.len(), active.len()),
            decay_candidates,
            decay_ratio: ratio(decay_candidates, active.len()),
            miss_ratio: ratio(misses, accesses.len()),
            merge_candidates,
            merge_ratio: ratio(merge_candidates, active.len()),
            low_confidence_ratio: ratio(low_confidence, rated.len()),
        }
    }

    /// Propose new params when the window statistics are significant
    ///
    /// Returns `Ok(None)` for an empty operations window or when no statistic
    /// clears the significance threshold.
    pub fn evaluate(
        &self,
        facts: &[MemoryFact],
        operations: &[MemoryOperation],
        current: &MemoryParams,
        now: DateTime<Utc>,
    ) -> Result<Option<ProposedParams>> {
        let op_count = Self::fact_operations(operations).count();
        if op_count == 0 {
            return Ok(None);
        }
        if op_count < self.config.min_operations {
            return Err(EvolutionError::InsufficientData {
                subsystem: EvolutionSubsystem::Memory,
                reason: format!("{} operations, need {}", op_count, self.config.min_operations),
            });
        }
        if facts.len() < self.config.min_facts {
            return Err(EvolutionError::InsufficientData {
                subsystem: EvolutionSubsystem::Memory,
                reason: format!("{} facts, need {}", facts.len(), self.config.min_facts),
            });
        }

        let stats = self.window_stats(facts, operations, current, now);
        let significance = self.config.significance_threshold;
        let mut next = current.clone();
        let mut changes = Vec::new();

        let mut raise_importance = false;
        if stats.decay_ratio > self.config.target_decay_ratio + significance {
            let reason = format!("{:.0}% of facts are decay candidates", stats.decay_ratio * 100.0);
            next.retention_window_days =
                clamp(RETENTION_BOUNDS, current.retention_window_days * RETENTION_SHRINK);
            Self::shift_decay(&mut next, -DECAY_STEP);
            raise_importance = true;
            changes.extend(current.diff(&next, &reason));
        } else if stats.miss_ratio > significance {
            let reason = format!("{:.0}% of accesses missed", stats.miss_ratio * 100.0);
            next.retention_window_days =
                clamp(RETENTION_BOUNDS, current.retention_window_days * RETENTION_GROW);
            Self::shift_decay(&mut next, DECAY_STEP);
            next.retrieval_top_k = (current.retrieval_top_k + TOP_K_STEP).min(TOP_K_BOUNDS.1);
            changes.extend(current.diff(&next, &reason));
        }

        if stats.merge_ratio > significance {
            let before = next.clone();
            next.consolidation_threshold = round3(clamp(
                CONSOLIDATION_BOUNDS,
                next.consolidation_threshold - THRESHOLD_STEP,
            ));
            let reason = format!("{} duplicate facts", stats.merge_candidates);
            changes.extend(before.diff(&next, &reason));
        }

        if raise_importance || stats.low_confidence_ratio > significance {
            let before = next.clone();
            next.importance_threshold = round3(clamp(
                IMPORTANCE_BOUNDS,
                next.importance_threshold + THRESHOLD_STEP,
            ));
            let reason = if raise_importance {
                "prune decaying facts sooner".to_string()
            } else {
                format!(
                    "{:.0}% low-confidence operations",
                    stats.low_confidence_ratio * 100.0
                )
            };
            changes.extend(before.diff(&next, &reason));
        }

        if changes.is_empty() {
            debug!("Memory window not significant: {:?}", stats);
            return Ok(None);
        }

        next.validate()?;
        Ok(Some(ProposedParams {
            params: next,
            changes,
            stats,
        }))
    }

    fn shift_decay(params: &mut MemoryParams, step: f32) {
        params.decay_rate_facts = round3(clamp(DECAY_BOUNDS, params.decay_rate_facts + step));
        params.decay_rate_beliefs = round3(clamp(DECAY_BOUNDS, params.decay_rate_beliefs + step));
        params.decay_rate_experiences =
            round3(clamp(DECAY_BOUNDS, params.decay_rate_experiences + step));
    }

    /// Evidence for a proposal: the fact operations of the window
    pub fn evidence(operations: &[MemoryOperation]) -> Evidence {
        Evidence {
            operations: Self::fact_operations(operations).map(|op| op.id).collect(),
            ..Evidence::default()
        }
    }

    /// Commit writing `proposed` as the next MemoryParams version
    pub fn commit_for(change: &ProposedChange, proposed: &ProposedParams, now: DateTime<Utc>) -> Commit {
        let summary = proposed
            .changes
            .iter()
            .map(|c| format!("{} {:.3} -> {:.3}", c.name, c.from, c.to))
            .collect::<Vec<_>>()
            .join(", ");
        let audit = MemoryOperation::new(change.scope.clone(), OperationKind::Tune, Vec::new(), now)
            .with_reason(summary);
        Commit::new(
            change.scope.clone(),
            change.base_version,
            OwnedEntity::MemoryParams(proposed.params.clone()),
            AuditEntry::Operation(audit),
            Some(change.id),
            change.triggers.clone(),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;
    use chrono::Duration;

    fn evolution() -> MemoryEvolution {
        MemoryEvolution::new(MemoryEvolutionConfig::default())
    }

    fn access(scope: &Scope, fact: &MemoryFact, at: DateTime<Utc>) -> MemoryOperation {
        MemoryOperation::new(scope.clone(), OperationKind::Access, vec![fact.id], at).with_confidence(0.9)
    }

    /// 50 facts: 45 cold low-confidence facts and 5 hot ones taking 40 accesses
    fn decaying_window(now: DateTime<Utc>) -> (Vec<MemoryFact>, Vec<MemoryOperation>) {
        let scope = Scope::default();
        let mut facts = Vec::new();
        for i in 0..45 {
            facts.push(MemoryFact::new(scope.clone(), format!("cold fact {}", i), 0.3, now - Duration::days(5)));
        }
        for i in 0..5 {
            facts.push(MemoryFact::new(scope.clone(), format!("hot fact {}", i), 0.9, now - Duration::days(5)));
        }
        let ops = (0..40)
            .map(|i| access(&scope, &facts[45 + i % 5], now - Duration::hours(i as i64)))
            .collect();
        (facts, ops)
    }

    #[test]
    fn test_empty_operations_is_no_change() {
        let now = Utc::now();
        let (facts, _) = decaying_window(now);
        let result = evolution().evaluate(&facts, &[], &MemoryParams::default(), now).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_small_window_is_insufficient() {
        let now = Utc::now();
        let (facts, ops) = decaying_window(now);
        let err = evolution()
            .evaluate(&facts, &ops[..3], &MemoryParams::default(), now)
            .unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn test_decaying_window_shortens_retention() {
        let now = Utc::now();
        let (facts, ops) = decaying_window(now);
        let current = MemoryParams::default();
        let proposal = evolution().evaluate(&facts, &ops, &current, now).unwrap().unwrap();

        assert!(proposal.params.retention_window_days < current.retention_window_days);
        assert!(proposal.params.decay_rate_facts < current.decay_rate_facts);
        assert!(proposal.params.importance_threshold > current.importance_threshold);
        assert_eq!(proposal.stats.decay_candidates, 45);
        assert!(proposal
            .changes
            .iter()
            .any(|c| c.name == "retention_window_days" && c.to == 24.0));
    }

    #[test]
    fn test_misses_lengthen_retention() {
        let now = Utc::now();
        let scope = Scope::default();
        let mut facts: Vec<MemoryFact> = (0..10)
            .map(|i| MemoryFact::new(scope.clone(), format!("fact {}", i), 0.9, now - Duration::hours(1)))
            .collect();
        let forgotten = now - Duration::minutes(30);
        for fact in facts.iter_mut().take(4) {
            fact.forgotten_at = Some(forgotten);
        }
        let ops: Vec<_> = facts.iter().map(|f| access(&scope, f, now)).collect();

        let current = MemoryParams::default();
        let proposal = evolution().evaluate(&facts, &ops, &current, now).unwrap().unwrap();
        assert!(proposal.params.retention_window_days > current.retention_window_days);
        assert_eq!(proposal.params.retrieval_top_k, 15);
    }

    #[test]
    fn test_balanced_window_is_no_change() {
        let now = Utc::now();
        let scope = Scope::default();
        let facts: Vec<MemoryFact> = (0..10)
            .map(|i| MemoryFact::new(scope.clone(), format!("fact {}", i), 0.9, now - Duration::hours(1)))
            .collect();
        let ops: Vec<_> = facts.iter().map(|f| access(&scope, f, now)).collect();

        let result = evolution().evaluate(&facts, &ops, &MemoryParams::default(), now).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_bounds_are_respected() {
        let params = MemoryParams {
            retrieval_top_k: 60,
            ..MemoryParams::default()
        };
        assert!(params.validate().is_err());

        let mut shrunk = MemoryParams {
            retention_window_days: 1.0,
            decay_rate_facts: 0.5,
            ..MemoryParams::default()
        };
        MemoryEvolution::shift_decay(&mut shrunk, -DECAY_STEP);
        assert_eq!(shrunk.decay_rate_facts, 0.5);
        assert!(shrunk.validate().is_ok());
    }
}
