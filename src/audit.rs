//! Commit records and audit replay
//!
//! Every committed version carries a [`CommitRecord`] inside its audit entry
//! (a `MemoryOperation` or an `AgentLog`). The record holds the full
//! snapshot plus the ids of the records that triggered it, so replaying the
//! records of one entity reconstructs its current version.

use crate::error::{EvolutionError, Result};
use crate::storage::{EntityKey, EvolutionStore, OwnedEntity, Versioned};
use crate::types::{AgentLogId, FeedbackId, OperationId, PatternId, ProposalId, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Records that justified a change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<FeedbackId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_logs: Vec<AgentLogId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<PatternId>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.feedback.is_empty()
            && self.operations.is_empty()
            && self.agent_logs.is_empty()
            && self.patterns.is_empty()
    }

    /// Union of two evidence sets, without duplicates
    pub fn merge(&mut self, other: &Evidence) {
        fn extend<T: PartialEq + Copy>(into: &mut Vec<T>, from: &[T]) {
            for id in from {
                if !into.contains(id) {
                    into.push(*id);
                }
            }
        }
        extend(&mut self.feedback, &other.feedback);
        extend(&mut self.operations, &other.operations);
        extend(&mut self.agent_logs, &other.agent_logs);
        extend(&mut self.patterns, &other.patterns);
    }
}

/// Snapshot attached to the audit entry of one committed version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub target: EntityKey,
    pub version: u64,
    pub snapshot: OwnedEntity,
    /// None for registrations and rollbacks
    pub proposal_id: Option<ProposalId>,
    pub evidence: Evidence,
    pub committed_at: DateTime<Utc>,
}

/// Rebuild the current version from commit records
///
/// Records must form the contiguous sequence 1..=n for a single target.
pub fn replay(records: &[CommitRecord]) -> Result<Option<Versioned<OwnedEntity>>> {
    let mut current: Option<Versioned<OwnedEntity>> = None;
    for (index, record) in records.iter().enumerate() {
        let expected = index as u64 + 1;
        if record.version != expected {
            return Err(EvolutionError::Storage(format!(
                "Audit gap for {}: expected version {}, found {}",
                record.target, expected, record.version
            )));
        }
        if let Some(prev) = records.first() {
            if prev.target != record.target {
                return Err(EvolutionError::Storage(format!(
                    "Audit for {} contains a record for {}",
                    prev.target, record.target
                )));
            }
        }
        current = Some(Versioned {
            version: record.version,
            value: record.snapshot.clone(),
            committed_at: record.committed_at,
        });
    }
    Ok(current)
}

/// Check that the audit trail of an entity reproduces its stored current version
pub async fn verify(store: &dyn EvolutionStore, scope: &Scope, key: &EntityKey) -> Result<bool> {
    let records = store.read_audit(scope, key).await?;
    let replayed = replay(&records)?;
    let current = store.get_current(scope, key).await?;
    Ok(match (replayed, current) {
        (None, None) => true,
        (Some(r), Some(c)) => r.version == c.version && r.value == c.value,
        _ => false,
    })
}
