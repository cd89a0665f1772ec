//! Storage layer for the evolution system
//!
//! Provides the [`EvolutionStore`] abstraction over the fact and agent
//! stores, plus the versioned-entity model used for optimistic commits.
//! Every owned entity (memory params, behavior profile, each agent) has one
//! current version per scope; history is append-only.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::audit::{CommitRecord, Evidence};
use crate::error::{EvolutionError, Result};
use crate::evolution::behavior::BehaviorProfile;
use crate::evolution::memory::MemoryParams;
use crate::evolution::proposal::EvolutionSubsystem;
use crate::types::{
    Agent, AgentId, AgentLog, AgentLogKind, LogLevel, MemoryFact, MemoryOperation, Pattern,
    ProposalId, Scope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifies one owned, versioned entity within a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityKey {
    MemoryParams,
    BehaviorProfile,
    Agent(AgentId),
}

impl EntityKey {
    /// Subsystem that owns this entity
    pub fn subsystem(&self) -> EvolutionSubsystem {
        match self {
            EntityKey::MemoryParams => EvolutionSubsystem::Memory,
            EntityKey::BehaviorProfile => EvolutionSubsystem::Behavior,
            EntityKey::Agent(_) => EvolutionSubsystem::Agents,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::MemoryParams => write!(f, "memory_params"),
            EntityKey::BehaviorProfile => write!(f, "behavior_profile"),
            EntityKey::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

impl FromStr for EntityKey {
    type Err = EvolutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory_params" => Ok(EntityKey::MemoryParams),
            "behavior_profile" => Ok(EntityKey::BehaviorProfile),
            other => match other.strip_prefix("agent:") {
                Some(id) => AgentId::from_string(id)
                    .map(EntityKey::Agent)
                    .map_err(|e| EvolutionError::Other(format!("Invalid agent id '{}': {}", id, e))),
                None => Err(EvolutionError::Other(format!(
                    "Unknown entity '{}': expected memory_params, behavior_profile or agent:<uuid>",
                    other
                ))),
            },
        }
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for EntityKey {
    type Error = EvolutionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Value of an owned entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum OwnedEntity {
    MemoryParams(MemoryParams),
    BehaviorProfile(BehaviorProfile),
    Agent(Agent),
}

impl OwnedEntity {
    pub fn key(&self) -> EntityKey {
        match self {
            OwnedEntity::MemoryParams(_) => EntityKey::MemoryParams,
            OwnedEntity::BehaviorProfile(_) => EntityKey::BehaviorProfile,
            OwnedEntity::Agent(agent) => EntityKey::Agent(agent.id),
        }
    }
}

/// One version of an owned entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// 1-based, contiguous per (scope, key)
    pub version: u64,
    pub value: T,
    pub committed_at: DateTime<Utc>,
}

impl<T> Versioned<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            version: self.version,
            value: f(self.value),
            committed_at: self.committed_at,
        }
    }
}

/// Audit record written together with a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "entry")]
pub enum AuditEntry {
    Operation(MemoryOperation),
    AgentLog(AgentLog),
}

impl AuditEntry {
    pub fn commit_record(&self) -> Option<&CommitRecord> {
        match self {
            AuditEntry::Operation(op) => op.commit.as_ref(),
            AuditEntry::AgentLog(log) => log.commit.as_ref(),
        }
    }

    fn attach(&mut self, record: CommitRecord) {
        match self {
            AuditEntry::Operation(op) => op.commit = Some(record),
            AuditEntry::AgentLog(log) => log.commit = Some(record),
        }
    }
}

/// Compare-and-swap write of a new entity version
#[derive(Debug, Clone)]
pub struct Commit {
    pub scope: Scope,
    /// Version the writer read; `None` means the entity must not exist yet
    pub expected_version: Option<u64>,
    pub entity: OwnedEntity,
    pub audit: AuditEntry,
    /// Pattern records persisted in the same transaction
    pub patterns: Vec<Pattern>,
}

impl Commit {
    /// Build a commit and attach its [`CommitRecord`] to the audit entry
    pub fn new(
        scope: Scope,
        expected_version: Option<u64>,
        entity: OwnedEntity,
        mut audit: AuditEntry,
        proposal_id: Option<ProposalId>,
        evidence: Evidence,
        committed_at: DateTime<Utc>,
    ) -> Self {
        let record = CommitRecord {
            target: entity.key(),
            version: expected_version.map_or(1, |v| v + 1),
            snapshot: entity.clone(),
            proposal_id,
            evidence,
            committed_at,
        };
        audit.attach(record);
        Self {
            scope,
            expected_version,
            entity,
            audit,
            patterns: Vec::new(),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<Pattern>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn target(&self) -> EntityKey {
        self.entity.key()
    }

    pub fn next_version(&self) -> u64 {
        self.expected_version.map_or(1, |v| v + 1)
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.audit
            .commit_record()
            .map(|r| r.committed_at)
            .unwrap_or_else(Utc::now)
    }

    pub(crate) fn conflict(&self, found: Option<u64>) -> EvolutionError {
        EvolutionError::CommitConflict {
            target: self.target().to_string(),
            expected: self.expected_version,
            found,
        }
    }
}

/// Store acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "ack")]
pub enum Ack {
    Committed { target: EntityKey, version: u64 },
    Appended { count: usize },
}

/// Storage collaborator for facts, operations, agents, agent logs and patterns
#[async_trait]
pub trait EvolutionStore: Send + Sync {
    /// Current version of an entity
    async fn get_current(&self, scope: &Scope, key: &EntityKey)
        -> Result<Option<Versioned<OwnedEntity>>>;

    /// All versions of an entity, oldest first
    async fn history(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<Versioned<OwnedEntity>>>;

    /// Current version of every entity in a scope
    async fn list_current(&self, scope: &Scope) -> Result<Vec<Versioned<OwnedEntity>>>;

    /// Write a new version if `expected_version` is still current
    ///
    /// The audit entry and patterns are written in the same transaction. On
    /// mismatch nothing is written and `CommitConflict` is returned.
    async fn commit(&self, commit: Commit) -> Result<Ack>;

    async fn append_fact(&self, fact: &MemoryFact) -> Result<Ack>;

    async fn read_facts(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>>;

    /// Append an operation and apply it to the facts it references
    async fn append_operation(&self, op: &MemoryOperation) -> Result<Ack>;

    async fn read_operations(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryOperation>>;

    async fn append_agent_log(&self, log: &AgentLog) -> Result<Ack>;

    async fn read_agent_logs(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgentLog>>;

    /// Insert or replace the pattern with the same (scope, key)
    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<Ack>;

    async fn read_patterns(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pattern>>;

    /// Commit records for an entity, ordered by version
    async fn read_audit(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<CommitRecord>>;

    /// Current memory params and their version; defaults when never committed
    async fn current_memory_params(&self, scope: &Scope) -> Result<(Option<u64>, MemoryParams)> {
        match self.get_current(scope, &EntityKey::MemoryParams).await? {
            Some(Versioned {
                version,
                value: OwnedEntity::MemoryParams(params),
                ..
            }) => Ok((Some(version), params)),
            Some(_) => Err(EvolutionError::Storage(
                "memory_params entry holds a different entity".to_string(),
            )),
            None => Ok((None, MemoryParams::default())),
        }
    }

    /// Current behavior profile and its version; defaults when never committed
    async fn current_behavior(&self, scope: &Scope) -> Result<(Option<u64>, BehaviorProfile)> {
        match self.get_current(scope, &EntityKey::BehaviorProfile).await? {
            Some(Versioned {
                version,
                value: OwnedEntity::BehaviorProfile(profile),
                ..
            }) => Ok((Some(version), profile)),
            Some(_) => Err(EvolutionError::Storage(
                "behavior_profile entry holds a different entity".to_string(),
            )),
            None => Ok((None, BehaviorProfile::default())),
        }
    }

    async fn current_agent(&self, scope: &Scope, id: AgentId) -> Result<Option<Versioned<Agent>>> {
        Ok(self
            .get_current(scope, &EntityKey::Agent(id))
            .await?
            .and_then(|v| match v.value {
                OwnedEntity::Agent(agent) => Some(Versioned {
                    version: v.version,
                    value: agent,
                    committed_at: v.committed_at,
                }),
                _ => None,
            }))
    }

    /// Current version of every agent in a scope
    async fn list_agents(&self, scope: &Scope) -> Result<Vec<Versioned<Agent>>> {
        Ok(self
            .list_current(scope)
            .await?
            .into_iter()
            .filter_map(|v| match v.value {
                OwnedEntity::Agent(agent) => Some(Versioned {
                    version: v.version,
                    value: agent,
                    committed_at: v.committed_at,
                }),
                _ => None,
            })
            .collect())
    }

    /// Store an agent as version 1
    async fn register_agent(&self, agent: Agent) -> Result<Ack> {
        let log = AgentLog::new(
            Some(agent.id),
            agent.scope.clone(),
            LogLevel::Info,
            format!("Registered agent '{}'", agent.name),
            AgentLogKind::Registered,
            agent.updated_at,
        );
        let commit = Commit::new(
            agent.scope.clone(),
            None,
            OwnedEntity::Agent(agent.clone()),
            AuditEntry::AgentLog(log),
            None,
            Evidence::default(),
            agent.updated_at,
        );
        self.commit(commit).await
    }
}

/// Records with timestamp >= since, oldest first, keeping the newest `limit`
pub(crate) fn window<T, F>(items: impl IntoIterator<Item = T>, ts: F, since: DateTime<Utc>, limit: usize) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let mut selected: Vec<T> = items.into_iter().filter(|i| ts(i) >= since).collect();
    selected.sort_by_key(|i| ts(i));
    let skip = selected.len().saturating_sub(limit);
    selected.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entity_key_string_form() {
        let id = AgentId::new();
        for key in [EntityKey::MemoryParams, EntityKey::BehaviorProfile, EntityKey::Agent(id)] {
            let parsed: EntityKey = key.to_string().parse().unwrap();
            assert_eq!(parsed, key);
        }
        assert!("agent:not-a-uuid".parse::<EntityKey>().is_err());

        let json = serde_json::to_string(&EntityKey::MemoryParams).unwrap();
        assert_eq!(json, "\"memory_params\"");
    }

    #[test]
    fn test_commit_attaches_record() {
        let now = Utc::now();
        let scope = Scope::default();
        let op = MemoryOperation::new(scope.clone(), crate::types::OperationKind::Tune, vec![], now);
        let commit = Commit::new(
            scope,
            Some(4),
            OwnedEntity::MemoryParams(MemoryParams::default()),
            AuditEntry::Operation(op),
            None,
            Evidence::default(),
            now,
        );
        let record = commit.audit.commit_record().unwrap();
        assert_eq!(record.version, 5);
        assert_eq!(commit.next_version(), 5);
        assert_eq!(record.target, EntityKey::MemoryParams);
    }

    #[test]
    fn test_window_keeps_newest() {
        let now = Utc::now();
        let stamps: Vec<_> = (0..5).map(|i| now - Duration::hours(i)).collect();
        let selected = window(stamps.clone(), |t| *t, now - Duration::hours(3), 2);
        assert_eq!(selected, vec![stamps[1], stamps[0]]);
    }
}
