//! Agent evolution
//!
//! Merges recommendations from memory evolution, behavior evolution and the
//! agent's own execution history into one proposed agent version. Every
//! evaluation produces a [`Lineage`] recording which recommendations were
//! applied, superseded or rejected, whether or not the agent changes.

use crate::audit::Evidence;
use crate::evolution::config::AgentEvolutionConfig;
use crate::evolution::proposal::{
    EvolutionPriority, EvolutionSubsystem, ParamChange, ProposalOutcome, ProposedChange,
    SubsystemRanking,
};
use crate::evolution::resolver::{self, Contender};
use crate::storage::{AuditEntry, Commit, OwnedEntity, Versioned};
use crate::types::{
    Agent, AgentId, AgentLog, AgentLogKind, AgentStatus, LogLevel, Pattern, PatternKind,
    ProposalId, RecommendationId, Scope,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Agent setting addressed by a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentField {
    RetentionDays,
    DecayRate,
    Verbosity,
    AskThreshold,
    ConfidenceThreshold,
    RetryCount,
    TimeoutSeconds,
    Status,
}

impl AgentField {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentField::RetentionDays => "retention_days",
            AgentField::DecayRate => "decay_rate",
            AgentField::Verbosity => "verbosity",
            AgentField::AskThreshold => "ask_threshold",
            AgentField::ConfidenceThreshold => "confidence_threshold",
            AgentField::RetryCount => "retry_count",
            AgentField::TimeoutSeconds => "timeout_seconds",
            AgentField::Status => "status",
        }
    }

    fn bounds(&self) -> (f64, f64) {
        match self {
            AgentField::RetentionDays => (1.0, 365.0),
            AgentField::DecayRate => (0.5, 0.99),
            AgentField::Verbosity | AgentField::AskThreshold => (0.0, 1.0),
            AgentField::ConfidenceThreshold => (0.1, 0.99),
            AgentField::RetryCount => (0.0, 10.0),
            AgentField::TimeoutSeconds => (1.0, 600.0),
            AgentField::Status => (0.0, 0.0),
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, AgentField::RetryCount | AgentField::TimeoutSeconds)
    }

    fn read(&self, agent: &Agent) -> Option<f64> {
        let s = &agent.settings;
        Some(match self {
            AgentField::RetentionDays => s.retention_days as f64,
            AgentField::DecayRate => s.decay_rate as f64,
            AgentField::Verbosity => s.verbosity as f64,
            AgentField::AskThreshold => s.ask_threshold as f64,
            AgentField::ConfidenceThreshold => s.confidence_threshold as f64,
            AgentField::RetryCount => s.retry_count as f64,
            AgentField::TimeoutSeconds => s.timeout_seconds as f64,
            AgentField::Status => return None,
        })
    }

    fn write(&self, agent: &mut Agent, value: f64) {
        let s = &mut agent.settings;
        match self {
            AgentField::RetentionDays => s.retention_days = value as f32,
            AgentField::DecayRate => s.decay_rate = value as f32,
            AgentField::Verbosity => s.verbosity = value as f32,
            AgentField::AskThreshold => s.ask_threshold = value as f32,
            AgentField::ConfidenceThreshold => s.confidence_threshold = value as f32,
            AgentField::RetryCount => s.retry_count = value as u32,
            AgentField::TimeoutSeconds => s.timeout_seconds = value as u32,
            AgentField::Status => {}
        }
    }
}

/// How a recommendation changes a field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Adjustment {
    Set(f64),
    Scale(f64),
    Shift(f64),
    SetStatus(AgentStatus),
}

impl Adjustment {
    fn apply(&self, current: f64) -> Option<f64> {
        match self {
            Adjustment::Set(v) => Some(*v),
            Adjustment::Scale(f) => Some(current * f),
            Adjustment::Shift(d) => Some(current + d),
            Adjustment::SetStatus(_) => None,
        }
    }
}

/// Upstream request to change one agent field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub origin: EvolutionSubsystem,
    pub priority: EvolutionPriority,
    pub field: AgentField,
    pub adjustment: Adjustment,
    pub reason: String,
    /// Proposal this recommendation was derived from
    pub proposal_id: Option<ProposalId>,
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn new(
        origin: EvolutionSubsystem,
        priority: EvolutionPriority,
        field: AgentField,
        adjustment: Adjustment,
        reason: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecommendationId::new(),
            origin,
            priority,
            field,
            adjustment,
            reason: reason.into(),
            proposal_id: None,
            created_at,
        }
    }

    pub fn with_proposal(mut self, proposal_id: ProposalId) -> Self {
        self.proposal_id = Some(proposal_id);
        self
    }
}

impl Contender for Recommendation {
    fn priority(&self) -> EvolutionPriority {
        self.priority
    }

    fn subsystem(&self) -> EvolutionSubsystem {
        self.origin
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn tiebreak(&self) -> Uuid {
        self.id.0
    }
}

/// What happened to one recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RecommendationOutcome {
    Applied,
    Superseded { by: RecommendationId },
    /// Winner, but the field already had the resulting value
    NoEffect,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub recommendation: Recommendation,
    pub outcome: RecommendationOutcome,
}

/// Audit of one agent evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub base_version: u64,
    pub entries: Vec<LineageEntry>,
    pub changes: Vec<ParamChange>,
    /// Set by the orchestrator once the cycle decides the proposal's fate
    pub outcome: ProposalOutcome,
}

impl Lineage {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, RecommendationOutcome::Applied))
    }

    pub fn superseded(&self) -> usize {
        self.count(|o| matches!(o, RecommendationOutcome::Superseded { .. }))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, RecommendationOutcome::Rejected { .. }))
    }

    /// Record a recommendation that was withdrawn before merging
    pub fn reject(&mut self, recommendation: Recommendation, reason: impl Into<String>) {
        self.entries.push(LineageEntry {
            recommendation,
            outcome: RecommendationOutcome::Rejected {
                reason: reason.into(),
            },
        });
    }

    fn count(&self, f: impl Fn(&RecommendationOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| f(&e.outcome)).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Evolution of agent '{}': {} applied, {} superseded, {} total ({:?})",
            self.agent_name,
            self.applied(),
            self.superseded(),
            self.entries.len(),
            self.outcome
        )
    }
}

/// Proposed next version of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAgentVersion {
    pub agent: Agent,
    pub lineage: Lineage,
}

/// Result of one agent evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvaluation {
    Proposed(ProposedAgentVersion),
    NoChange(Lineage),
}

impl AgentEvaluation {
    pub fn lineage(&self) -> &Lineage {
        match self {
            AgentEvaluation::Proposed(p) => &p.lineage,
            AgentEvaluation::NoChange(l) => l,
        }
    }

    pub fn lineage_mut(&mut self) -> &mut Lineage {
        match self {
            AgentEvaluation::Proposed(p) => &mut p.lineage,
            AgentEvaluation::NoChange(l) => l,
        }
    }
}

/// Agent evolution subsystem
pub struct AgentEvolution {
    config: AgentEvolutionConfig,
}

impl AgentEvolution {
    pub fn new(config: AgentEvolutionConfig) -> Self {
        Self { config }
    }

    pub fn ranking(&self) -> &SubsystemRanking {
        &self.config.subsystem_ranking
    }

    /// Recommendations derived from the agent's own execution logs
    pub fn performance_recommendations(
        &self,
        agent: &Agent,
        logs: &[AgentLog],
        priority: EvolutionPriority,
        now: DateTime<Utc>,
    ) -> (Vec<Recommendation>, Evidence) {
        let runs: Vec<(&AgentLog, bool)> = logs
            .iter()
            .filter(|l| l.agent_id == Some(agent.id))
            .filter_map(|l| l.execution_success().map(|s| (l, s)))
            .collect();
        let evidence = Evidence {
            agent_logs: runs.iter().map(|(l, _)| l.id).collect(),
            ..Evidence::default()
        };

        let mut recs = Vec::new();
        let total = runs.len() as u32;
        if total < self.config.min_runs_for_analysis {
            return (recs, evidence);
        }

        let rate = runs.iter().filter(|(_, s)| *s).count() as f32 / total as f32;
        let min = self.config.success_rate_min;
        let rec = |field, adjustment, reason: String| {
            Recommendation::new(EvolutionSubsystem::Agents, priority, field, adjustment, reason, now)
        };

        if rate < min {
            let reason = format!("success rate {:.0}% over {} runs", rate * 100.0, total);
            recs.push(rec(AgentField::RetryCount, Adjustment::Shift(1.0), reason.clone()));
            recs.push(rec(AgentField::TimeoutSeconds, Adjustment::Scale(1.5), reason.clone()));
            if rate < min * 0.5 && total >= self.config.min_runs_for_analysis * 2 {
                recs.push(rec(
                    AgentField::Status,
                    Adjustment::SetStatus(AgentStatus::Disabled),
                    reason,
                ));
            }
        } else if agent.status == AgentStatus::Draft {
            recs.push(rec(
                AgentField::Status,
                Adjustment::SetStatus(AgentStatus::Active),
                format!("promoted after {} runs at {:.0}%", total, rate * 100.0),
            ));
        }

        (recs, evidence)
    }

    /// Recommendations from recurring failure patterns behavior evolution found for this agent
    pub fn pattern_recommendations(
        &self,
        agent: &Agent,
        patterns: &[Pattern],
        priority: EvolutionPriority,
        now: DateTime<Utc>,
    ) -> (Vec<Recommendation>, Evidence) {
        let mut recs = Vec::new();
        let mut evidence = Evidence::default();
        let threshold = self.config.failure_pattern_support;

        for pattern in patterns.iter().filter(|p| {
            p.kind == PatternKind::RecurringFailure && p.agent_id == Some(agent.id)
        }) {
            if pattern.support < threshold {
                debug!(
                    "Pattern {} below agent threshold ({} < {})",
                    pattern.key, pattern.support, threshold
                );
                continue;
            }
            evidence.patterns.push(pattern.id);
            let reason = format!(
                "{} pattern (support {}, confidence {:.2})",
                pattern.kind.as_str(),
                pattern.support,
                pattern.confidence
            );
            recs.push(Recommendation::new(
                EvolutionSubsystem::Agents,
                priority,
                AgentField::RetryCount,
                Adjustment::Shift(1.0),
                reason.clone(),
                now,
            ));
            if pattern.support >= threshold * 2 {
                recs.push(Recommendation::new(
                    EvolutionSubsystem::Agents,
                    priority,
                    AgentField::TimeoutSeconds,
                    Adjustment::Scale(1.5),
                    reason,
                    now,
                ));
            }
        }

        (recs, evidence)
    }

    /// Merge upstream recommendations into one proposed agent version
    pub fn evaluate(
        &self,
        current: &Versioned<Agent>,
        from_memory: &[Recommendation],
        from_behavior: &[Recommendation],
        from_performance: &[Recommendation],
        now: DateTime<Utc>,
    ) -> AgentEvaluation {
        let agent = &current.value;
        let mut by_field: BTreeMap<AgentField, Vec<Recommendation>> = BTreeMap::new();
        for rec in from_memory.iter().chain(from_behavior).chain(from_performance) {
            by_field.entry(rec.field).or_default().push(rec.clone());
        }

        let mut next = agent.clone();
        let mut entries = Vec::new();
        let mut changes = Vec::new();

        for (field, candidates) in by_field {
            let Some(winner) = resolver::winner(&candidates, self.ranking()).cloned() else {
                continue;
            };
            for rec in candidates.iter().filter(|r| r.id != winner.id) {
                debug!(
                    "Recommendation {} on {} superseded by {} ({} {})",
                    rec.id,
                    field.as_str(),
                    winner.id,
                    winner.origin,
                    winner.priority
                );
                entries.push(LineageEntry {
                    recommendation: rec.clone(),
                    outcome: RecommendationOutcome::Superseded { by: winner.id },
                });
            }

            let outcome = Self::apply(&mut next, field, &winner.adjustment, &winner.reason, &mut changes);
            entries.push(LineageEntry {
                recommendation: winner,
                outcome,
            });
        }

        let lineage = Lineage {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            base_version: current.version,
            entries,
            changes,
            outcome: ProposalOutcome::NoChange,
        };

        if lineage.changes.is_empty() {
            AgentEvaluation::NoChange(lineage)
        } else {
            next.updated_at = now;
            AgentEvaluation::Proposed(ProposedAgentVersion {
                agent: next,
                lineage,
            })
        }
    }

    fn apply(
        agent: &mut Agent,
        field: AgentField,
        adjustment: &Adjustment,
        reason: &str,
        changes: &mut Vec<ParamChange>,
    ) -> RecommendationOutcome {
        if let (AgentField::Status, Adjustment::SetStatus(status)) = (field, adjustment) {
            if agent.status == *status {
                return RecommendationOutcome::NoEffect;
            }
            changes.push(ParamChange::new(
                field.as_str(),
                agent.status as u8 as f64,
                *status as u8 as f64,
                format!("{} ({:?} -> {:?})", reason, agent.status, status),
            ));
            agent.status = *status;
            return RecommendationOutcome::Applied;
        }

        let (Some(current), Some(raw)) = (
            field.read(agent),
            field.read(agent).and_then(|c| adjustment.apply(c)),
        ) else {
            return RecommendationOutcome::Rejected {
                reason: format!("{:?} does not apply to {}", adjustment, field.as_str()),
            };
        };

        let (lo, hi) = field.bounds();
        let mut value = raw.clamp(lo, hi);
        if field.is_integer() {
            value = value.round();
        }
        value = (value * 1000.0).round() / 1000.0;

        if (value - current).abs() < 1e-6 {
            return RecommendationOutcome::NoEffect;
        }
        changes.push(ParamChange::new(field.as_str(), current, value, reason));
        field.write(agent, value);
        RecommendationOutcome::Applied
    }

    /// Standalone lineage entry for evaluations that did not commit
    pub fn lineage_log(scope: &Scope, lineage: &Lineage, now: DateTime<Utc>) -> AgentLog {
        AgentLog::new(
            Some(lineage.agent_id),
            scope.clone(),
            LogLevel::Info,
            lineage.summary(),
            AgentLogKind::Evolution(lineage.clone()),
            now,
        )
    }

    /// Commit writing the proposed agent as its next version
    pub fn commit_for(
        change: &ProposedChange,
        proposed: &ProposedAgentVersion,
        now: DateTime<Utc>,
    ) -> Commit {
        let mut lineage = proposed.lineage.clone();
        lineage.outcome = ProposalOutcome::Applied {
            version: change.base_version.map_or(1, |v| v + 1),
        };
        let log = Self::lineage_log(&change.scope, &lineage, now);
        let mut agent = proposed.agent.clone();
        agent.updated_at = now;
        Commit::new(
            change.scope.clone(),
            change.base_version,
            OwnedEntity::Agent(agent),
            AuditEntry::AgentLog(log),
            Some(change.id),
            change.triggers.clone(),
            now,
        )
    }
}
