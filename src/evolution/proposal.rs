//! Proposals exchanged between the subsystems and the orchestrator
//!
//! A proposal is a candidate change to one owned entity. Nothing in this
//! module touches storage; proposals become versions only when the
//! orchestrator commits them.

use crate::audit::Evidence;
use crate::error::EvolutionError;
use crate::evolution::agent::ProposedAgentVersion;
use crate::evolution::behavior::BehaviorUpdate;
use crate::evolution::memory::ProposedParams;
use crate::storage::{EntityKey, OwnedEntity};
use crate::types::{ProposalId, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ordered urgency of an evolution request (critical > high > normal > low)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionPriority {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    Critical,
}

impl EvolutionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionPriority::Low => "low",
            EvolutionPriority::Normal => "normal",
            EvolutionPriority::High => "high",
            EvolutionPriority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for EvolutionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EvolutionPriority {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EvolutionPriority::Low),
            "normal" | "medium" => Ok(EvolutionPriority::Normal),
            "high" => Ok(EvolutionPriority::High),
            "critical" => Ok(EvolutionPriority::Critical),
            other => Err(EvolutionError::Other(format!("Unknown priority: {}", other))),
        }
    }
}

/// The three evolving subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionSubsystem {
    Memory,
    Behavior,
    Agents,
}

impl EvolutionSubsystem {
    pub const ALL: [EvolutionSubsystem; 3] = [
        EvolutionSubsystem::Memory,
        EvolutionSubsystem::Behavior,
        EvolutionSubsystem::Agents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionSubsystem::Memory => "memory",
            EvolutionSubsystem::Behavior => "behavior",
            EvolutionSubsystem::Agents => "agents",
        }
    }
}

impl std::fmt::Display for EvolutionSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EvolutionSubsystem {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(EvolutionSubsystem::Memory),
            "behavior" | "behaviour" => Ok(EvolutionSubsystem::Behavior),
            "agents" | "agent" => Ok(EvolutionSubsystem::Agents),
            other => Err(EvolutionError::Other(format!("Unknown subsystem: {}", other))),
        }
    }
}

/// Subsystem precedence used when priorities tie; earlier entries outrank later ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubsystemRanking(pub Vec<EvolutionSubsystem>);

impl SubsystemRanking {
    /// Position of a subsystem; lower outranks higher. Unlisted subsystems rank last.
    pub fn rank(&self, subsystem: EvolutionSubsystem) -> usize {
        self.0
            .iter()
            .position(|s| *s == subsystem)
            .unwrap_or(self.0.len())
    }

    /// True if every subsystem appears exactly once
    pub fn is_complete(&self) -> bool {
        self.0.len() == EvolutionSubsystem::ALL.len()
            && EvolutionSubsystem::ALL.iter().all(|s| self.0.contains(s))
    }
}

impl Default for SubsystemRanking {
    fn default() -> Self {
        Self(EvolutionSubsystem::ALL.to_vec())
    }
}

/// One scalar parameter change inside a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamChange {
    pub name: String,
    pub from: f64,
    pub to: f64,
    pub reason: String,
}

impl ParamChange {
    pub fn new(name: impl Into<String>, from: f64, to: f64, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from,
            to,
            reason: reason.into(),
        }
    }

    pub fn delta(&self) -> f64 {
        self.to - self.from
    }
}

/// Subsystem specific content of a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "subsystem")]
pub enum ChangePayload {
    Memory(ProposedParams),
    Behavior(BehaviorUpdate),
    Agent(ProposedAgentVersion),
}

impl ChangePayload {
    /// The entity value that becomes current if this payload is committed
    pub fn entity(&self) -> OwnedEntity {
        match self {
            ChangePayload::Memory(p) => OwnedEntity::MemoryParams(p.params.clone()),
            ChangePayload::Behavior(b) => OwnedEntity::BehaviorProfile(b.profile.clone()),
            ChangePayload::Agent(a) => OwnedEntity::Agent(a.agent.clone()),
        }
    }
}

/// Candidate change to one owned entity, not yet applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedChange {
    pub id: ProposalId,
    pub subsystem: EvolutionSubsystem,
    pub priority: EvolutionPriority,
    pub scope: Scope,
    pub target: EntityKey,
    /// Version read during evaluation; commit fails if it is no longer current
    pub base_version: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Records that triggered this proposal
    pub triggers: Evidence,
    /// Proposal whose failed commit this one retries
    pub retry_of: Option<ProposalId>,
    pub payload: ChangePayload,
}

impl ProposedChange {
    pub fn new(
        subsystem: EvolutionSubsystem,
        priority: EvolutionPriority,
        scope: Scope,
        target: EntityKey,
        base_version: Option<u64>,
        payload: ChangePayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProposalId::new(),
            subsystem,
            priority,
            scope,
            target,
            base_version,
            created_at,
            triggers: Evidence::default(),
            retry_of: None,
            payload,
        }
    }

    pub fn with_triggers(mut self, triggers: Evidence) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_retry_of(mut self, retry_of: Option<ProposalId>) -> Self {
        self.retry_of = retry_of;
        self
    }

    /// Two proposals are mutually exclusive when they touch the same owned entity
    pub fn conflicts_with(&self, other: &ProposedChange) -> bool {
        self.scope == other.scope && self.target == other.target
    }
}

/// What happened to a proposal (or subsystem) in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProposalOutcome {
    Applied { version: u64 },
    Superseded { by: ProposalId },
    NoChange,
    Skipped { reason: String },
    RetryScheduled { attempt: u32 },
    Failed { reason: String },
    RolledBack { version: u64 },
}

impl ProposalOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProposalOutcome::Applied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(EvolutionPriority::Critical > EvolutionPriority::High);
        assert!(EvolutionPriority::High > EvolutionPriority::Normal);
        assert!(EvolutionPriority::Normal > EvolutionPriority::Low);
        assert_eq!(
            "medium".parse::<EvolutionPriority>().unwrap(),
            EvolutionPriority::Normal
        );
        let parsed: EvolutionPriority = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, EvolutionPriority::Normal);
    }

    #[test]
    fn test_ranking() {
        let ranking = SubsystemRanking::default();
        assert!(ranking.rank(EvolutionSubsystem::Memory) < ranking.rank(EvolutionSubsystem::Behavior));
        assert!(ranking.is_complete());

        let custom = SubsystemRanking(vec![EvolutionSubsystem::Behavior]);
        assert_eq!(custom.rank(EvolutionSubsystem::Agents), 1);
        assert!(!custom.is_complete());
    }

    #[test]
    fn test_subsystem_display() {
        assert_eq!(EvolutionSubsystem::Agents.to_string(), "agents");
        assert_eq!(
            "behaviour".parse::<EvolutionSubsystem>().unwrap(),
            EvolutionSubsystem::Behavior
        );
    }
}
