//! Core data types for the Observer evolution system
//!
//! This module defines the records the evolution subsystems read and write:
//! scopes, memory facts and the operations applied to them, agents with their
//! execution history, and detected behavior patterns.

use crate::audit::CommitRecord;
use crate::error::EvolutionError;
use crate::evolution::agent::Lineage;
use crate::evolution::proposal::ParamChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from a string
            pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for memory facts
    FactId
);
uuid_id!(
    /// Unique identifier for memory operations
    OperationId
);
uuid_id!(
    /// Unique identifier for agents
    AgentId
);
uuid_id!(
    /// Unique identifier for agent log entries
    AgentLogId
);
uuid_id!(
    /// Unique identifier for detected patterns
    PatternId
);
uuid_id!(
    /// Unique identifier for feedback events
    FeedbackId
);
uuid_id!(
    /// Unique identifier for evolution proposals
    ProposalId
);
uuid_id!(
    /// Unique identifier for evolution cycles
    CycleId
);
uuid_id!(
    /// Unique identifier for agent recommendations
    RecommendationId
);

/// Key under which versioned entities are tracked
///
/// Mirrors the route layer's device and chat-session identifiers. `Global`
/// holds defaults shared by every device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Scope {
    Global,
    Device { id: String },
    Session { id: String },
}

impl Scope {
    pub fn device(id: impl Into<String>) -> Self {
        Scope::Device { id: id.into() }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Scope::Session { id: id.into() }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Session {
            id: "default".to_string(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Device { id } => write!(f, "device:{}", id),
            Scope::Session { id } => write!(f, "session:{}", id),
        }
    }
}

impl FromStr for Scope {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Scope::Global);
        }
        match s.split_once(':') {
            Some(("device", id)) if !id.is_empty() => Ok(Scope::device(id)),
            Some(("session", id)) if !id.is_empty() => Ok(Scope::session(id)),
            _ => Err(EvolutionError::Other(format!(
                "Invalid scope '{}': expected global, device:<id> or session:<id>",
                s
            ))),
        }
    }
}

/// Atomic unit of recorded knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: FactId,
    pub scope: Scope,
    pub content: String,
    /// preference, habit, goal, demographic, skill
    pub fact_type: String,
    /// Confidence (0.0 - 1.0), lowered by decay operations
    pub confidence: f32,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u32,
    pub forgotten_at: Option<DateTime<Utc>>,
}

impl MemoryFact {
    pub fn new(
        scope: Scope,
        content: impl Into<String>,
        confidence: f32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FactId::new(),
            scope,
            content: content.into(),
            fact_type: "preference".to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            source: None,
            created_at,
            last_accessed_at: None,
            access_count: 0,
            forgotten_at: None,
        }
    }

    pub fn is_forgotten(&self) -> bool {
        self.forgotten_at.is_some()
    }

    /// Lowercased, whitespace-collapsed content used for duplicate detection
    pub fn normalized_content(&self) -> String {
        self.content
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Days since the fact was last touched (accessed or created)
    pub fn days_idle(&self, now: DateTime<Utc>) -> f32 {
        let last = self.last_accessed_at.unwrap_or(self.created_at);
        (now.signed_duration_since(last).num_seconds().max(0) as f32) / 86400.0
    }

    /// Confidence after applying a daily decay rate for the idle period
    pub fn effective_weight(&self, decay_rate: f32, now: DateTime<Utc>) -> f32 {
        self.confidence * decay_rate.powf(self.days_idle(now))
    }

    /// Apply a memory operation that references this fact
    ///
    /// Facts are only ever mutated through operations. Operations that do
    /// not reference the fact leave it untouched.
    pub fn apply_operation(&mut self, op: &MemoryOperation) {
        let Some(position) = op.fact_ids.iter().position(|id| *id == self.id) else {
            return;
        };

        match op.kind {
            OperationKind::Access => {
                self.access_count = self.access_count.saturating_add(1);
                self.last_accessed_at = Some(op.timestamp);
            }
            OperationKind::Decay => {
                if let Some(confidence) = op.confidence {
                    self.confidence = confidence.clamp(0.0, 1.0);
                }
            }
            // The first fact of a merge survives and absorbs the rest
            OperationKind::Merge if position > 0 => {
                self.forgotten_at = Some(op.timestamp);
            }
            OperationKind::Forget => {
                self.forgotten_at = Some(op.timestamp);
            }
            _ => {}
        }
    }
}

/// Kind of mutation recorded in the memory audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Access,
    Decay,
    Merge,
    Forget,
    /// Memory policy parameters evolved
    Tune,
    /// Memory policy parameters restored to an earlier version
    Rollback,
}

/// Append-only record of a single mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryOperation {
    pub id: OperationId,
    pub scope: Scope,
    pub kind: OperationKind,
    pub fact_ids: Vec<FactId>,
    /// Confidence reported by the operation (or resulting confidence for decay)
    pub confidence: Option<f32>,
    pub reason: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// Present when this operation is the audit entry of a committed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRecord>,
}

impl MemoryOperation {
    pub fn new(
        scope: Scope,
        kind: OperationKind,
        fact_ids: Vec<FactId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            scope,
            kind,
            fact_ids,
            confidence: None,
            reason: None,
            success: true,
            timestamp,
            commit: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_commit(mut self, commit: CommitRecord) -> Self {
        self.commit = Some(commit);
        self
    }
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Newly created, not yet trusted
    Draft,
    Active,
    /// Switched off because it keeps failing
    Disabled,
}

/// Tunable agent settings touched by evolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub retention_days: f32,
    pub decay_rate: f32,
    pub verbosity: f32,
    pub ask_threshold: f32,
    pub confidence_threshold: f32,
    pub retry_count: u32,
    pub timeout_seconds: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            retention_days: 30.0,
            decay_rate: 0.95,
            verbosity: 0.5,
            ask_threshold: 0.5,
            confidence_threshold: 0.8,
            retry_count: 3,
            timeout_seconds: 30,
        }
    }
}

/// Agent configuration; one current version per scope and id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub scope: Scope,
    pub name: String,
    /// time_based, event_based, sequence_based
    pub agent_type: String,
    pub status: AgentStatus,
    pub settings: AgentSettings,
    pub run_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(scope: Scope, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: AgentId::new(),
            scope,
            name: name.into(),
            agent_type: "event_based".to_string(),
            status: AgentStatus::Draft,
            settings: AgentSettings::default(),
            run_count: 0,
            success_count: 0,
            error_count: 0,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }
}

/// Severity of an agent log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// What an agent log entry documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AgentLogKind {
    /// One agent run
    Execution {
        success: bool,
        duration_ms: Option<u64>,
    },
    /// Lineage of one agent evaluation
    Evolution(Lineage),
    /// Scope-wide behavior profile change
    BehaviorAdjusted { changes: Vec<ParamChange> },
    /// Agent first stored
    Registered,
    /// Entity restored to an earlier version
    Rollback { restored_version: u64 },
}

/// Immutable agent execution and evolution history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: AgentLogId,
    /// None for scope-wide entries such as behavior adjustments
    pub agent_id: Option<AgentId>,
    pub scope: Scope,
    pub level: LogLevel,
    pub message: String,
    pub kind: AgentLogKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRecord>,
}

impl AgentLog {
    pub fn new(
        agent_id: Option<AgentId>,
        scope: Scope,
        level: LogLevel,
        message: impl Into<String>,
        kind: AgentLogKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AgentLogId::new(),
            agent_id,
            scope,
            level,
            message: message.into(),
            kind,
            created_at,
            commit: None,
        }
    }

    /// Log entry for a single agent run
    pub fn execution(
        agent_id: AgentId,
        scope: Scope,
        success: bool,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let level = if success { LogLevel::Info } else { LogLevel::Error };
        Self::new(
            Some(agent_id),
            scope,
            level,
            message,
            AgentLogKind::Execution {
                success,
                duration_ms: None,
            },
            created_at,
        )
    }

    pub fn with_commit(mut self, commit: CommitRecord) -> Self {
        self.commit = Some(commit);
        self
    }

    /// Success flag if this entry records an agent run
    pub fn execution_success(&self) -> Option<bool> {
        match self.kind {
            AgentLogKind::Execution { success, .. } => Some(success),
            _ => None,
        }
    }
}

/// Kind of recurring structure detected by behavior evolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    BrevityRequest,
    DetailRequest,
    NegativeFeedback,
    PositiveFeedback,
    FormalityRequest,
    CasualRequest,
    Forgetfulness,
    RecurringFailure,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::BrevityRequest => "brevity_request",
            PatternKind::DetailRequest => "detail_request",
            PatternKind::NegativeFeedback => "negative_feedback",
            PatternKind::PositiveFeedback => "positive_feedback",
            PatternKind::FormalityRequest => "formality_request",
            PatternKind::CasualRequest => "casual_request",
            PatternKind::Forgetfulness => "forgetfulness",
            PatternKind::RecurringFailure => "recurring_failure",
        }
    }
}

/// Detected recurring behavioral or usage structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub scope: Scope,
    /// Stable key; patterns are upserted by (scope, key)
    pub key: String,
    pub kind: PatternKind,
    pub agent_id: Option<AgentId>,
    pub support: u32,
    pub confidence: f32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_scope_round_trip_through_display() {
        for scope in [Scope::Global, Scope::device("mac-1"), Scope::session("abc")] {
            let parsed: Scope = scope.to_string().parse().unwrap();
            assert_eq!(parsed, scope);
        }
        assert!("device:".parse::<Scope>().is_err());
        assert!("project:x".parse::<Scope>().is_err());
    }

    #[test]
    fn test_fact_access_and_forget() {
        let now = Utc::now();
        let scope = Scope::default();
        let mut fact = MemoryFact::new(scope.clone(), "Likes  Rust", 0.9, now);

        let access = MemoryOperation::new(scope.clone(), OperationKind::Access, vec![fact.id], now);
        fact.apply_operation(&access);
        assert_eq!(fact.access_count, 1);
        assert_eq!(fact.last_accessed_at, Some(now));

        let unrelated = MemoryOperation::new(scope.clone(), OperationKind::Forget, vec![FactId::new()], now);
        fact.apply_operation(&unrelated);
        assert!(!fact.is_forgotten());

        let forget = MemoryOperation::new(scope, OperationKind::Forget, vec![fact.id], now);
        fact.apply_operation(&forget);
        assert!(fact.is_forgotten());
        assert_eq!(fact.normalized_content(), "likes rust");
    }

    #[test]
    fn test_merge_keeps_first_fact() {
        let now = Utc::now();
        let scope = Scope::default();
        let mut first = MemoryFact::new(scope.clone(), "a", 0.9, now);
        let mut second = MemoryFact::new(scope.clone(), "a", 0.9, now);
        let merge = MemoryOperation::new(scope, OperationKind::Merge, vec![first.id, second.id], now);

        first.apply_operation(&merge);
        second.apply_operation(&merge);
        assert!(!first.is_forgotten());
        assert!(second.is_forgotten());
    }

    #[test]
    fn test_effective_weight_decays_with_idle_time() {
        let now = Utc::now();
        let fact = MemoryFact::new(Scope::Global, "x", 1.0, now - Duration::days(10));
        let weight = fact.effective_weight(0.9, now);
        assert!((weight - 0.9_f32.powf(10.0)).abs() < 0.01);
    }
}
