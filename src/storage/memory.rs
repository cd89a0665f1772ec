//! In-process store backed by tokio `RwLock`

use super::{window, Ack, AuditEntry, Commit, EntityKey, EvolutionStore, OwnedEntity, Versioned};
use crate::audit::CommitRecord;
use crate::error::Result;
use crate::types::{AgentLog, MemoryFact, MemoryOperation, Pattern, Scope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    versions: HashMap<(Scope, EntityKey), Vec<Versioned<OwnedEntity>>>,
    facts: Vec<MemoryFact>,
    operations: Vec<MemoryOperation>,
    agent_logs: Vec<AgentLog>,
    patterns: HashMap<(Scope, String), Pattern>,
}

impl Inner {
    fn apply_operation(&mut self, op: &MemoryOperation) {
        for fact in self
            .facts
            .iter_mut()
            .filter(|f| f.scope == op.scope && op.fact_ids.contains(&f.id))
        {
            fact.apply_operation(op);
        }
        self.operations.push(op.clone());
    }
}

/// Store used by tests and single-process deployments
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvolutionStore for InMemoryStore {
    async fn get_current(
        &self,
        scope: &Scope,
        key: &EntityKey,
    ) -> Result<Option<Versioned<OwnedEntity>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .get(&(scope.clone(), *key))
            .and_then(|h| h.last().cloned()))
    }

    async fn history(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<Versioned<OwnedEntity>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .get(&(scope.clone(), *key))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_current(&self, scope: &Scope) -> Result<Vec<Versioned<OwnedEntity>>> {
        let inner = self.inner.read().await;
        let mut current: Vec<(EntityKey, Versioned<OwnedEntity>)> = inner
            .versions
            .iter()
            .filter(|((s, _), _)| s == scope)
            .filter_map(|((_, key), h)| h.last().cloned().map(|v| (*key, v)))
            .collect();
        current.sort_by_key(|(key, _)| *key);
        Ok(current.into_iter().map(|(_, v)| v).collect())
    }

    async fn commit(&self, commit: Commit) -> Result<Ack> {
        let mut inner = self.inner.write().await;
        let target = commit.target();
        let slot = (commit.scope.clone(), target);

        let found = inner
            .versions
            .get(&slot)
            .and_then(|h| h.last())
            .map(|v| v.version);
        if found != commit.expected_version {
            return Err(commit.conflict(found));
        }

        let version = commit.next_version();
        let committed_at = commit.committed_at();
        inner.versions.entry(slot).or_default().push(Versioned {
            version,
            value: commit.entity,
            committed_at,
        });
        match commit.audit {
            AuditEntry::Operation(op) => inner.apply_operation(&op),
            AuditEntry::AgentLog(log) => inner.agent_logs.push(log),
        }
        for pattern in commit.patterns {
            inner
                .patterns
                .insert((pattern.scope.clone(), pattern.key.clone()), pattern);
        }

        Ok(Ack::Committed { target, version })
    }

    async fn append_fact(&self, fact: &MemoryFact) -> Result<Ack> {
        let mut inner = self.inner.write().await;
        inner.facts.retain(|f| f.id != fact.id);
        inner.facts.push(fact.clone());
        Ok(Ack::Appended { count: 1 })
    }

    async fn read_facts(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        let inner = self.inner.read().await;
        let facts = inner.facts.iter().filter(|f| &f.scope == scope).cloned();
        Ok(window(facts, |f| f.created_at, since, limit))
    }

    async fn append_operation(&self, op: &MemoryOperation) -> Result<Ack> {
        let mut inner = self.inner.write().await;
        inner.apply_operation(op);
        Ok(Ack::Appended { count: 1 })
    }

    async fn read_operations(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryOperation>> {
        let inner = self.inner.read().await;
        let ops = inner.operations.iter().filter(|o| &o.scope == scope).cloned();
        Ok(window(ops, |o| o.timestamp, since, limit))
    }

    async fn append_agent_log(&self, log: &AgentLog) -> Result<Ack> {
        let mut inner = self.inner.write().await;
        inner.agent_logs.push(log.clone());
        Ok(Ack::Appended { count: 1 })
    }

    async fn read_agent_logs(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgentLog>> {
        let inner = self.inner.read().await;
        let logs = inner.agent_logs.iter().filter(|l| &l.scope == scope).cloned();
        Ok(window(logs, |l| l.created_at, since, limit))
    }

    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<Ack> {
        let mut inner = self.inner.write().await;
        inner
            .patterns
            .insert((pattern.scope.clone(), pattern.key.clone()), pattern.clone());
        Ok(Ack::Appended { count: 1 })
    }

    async fn read_patterns(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        let inner = self.inner.read().await;
        let patterns = inner
            .patterns
            .values()
            .filter(|p| &p.scope == scope)
            .cloned();
        Ok(window(patterns, |p| p.last_seen_at, since, limit))
    }

    async fn read_audit(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<CommitRecord>> {
        let inner = self.inner.read().await;
        let from_ops = inner
            .operations
            .iter()
            .filter(|o| &o.scope == scope)
            .filter_map(|o| o.commit.clone());
        let from_logs = inner
            .agent_logs
            .iter()
            .filter(|l| &l.scope == scope)
            .filter_map(|l| l.commit.clone());

        let mut records: Vec<CommitRecord> = from_ops
            .chain(from_logs)
            .filter(|r| &r.target == key)
            .collect();
        records.sort_by_key(|r| r.version);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Evidence;
    use crate::evolution::memory::MemoryParams;
    use crate::types::{Agent, OperationKind};
    use chrono::Duration;

    fn params_commit(scope: &Scope, expected: Option<u64>, retention: f32) -> Commit {
        let now = Utc::now();
        let params = MemoryParams {
            retention_window_days: retention,
            ..MemoryParams::default()
        };
        Commit::new(
            scope.clone(),
            expected,
            OwnedEntity::MemoryParams(params),
            AuditEntry::Operation(MemoryOperation::new(scope.clone(), OperationKind::Tune, vec![], now)),
            None,
            Evidence::default(),
            now,
        )
    }

    #[tokio::test]
    async fn test_commit_compare_and_swap() {
        let store = InMemoryStore::new();
        let scope = Scope::default();

        store.commit(params_commit(&scope, None, 30.0)).await.unwrap();
        let ack = store.commit(params_commit(&scope, Some(1), 24.0)).await.unwrap();
        assert_eq!(
            ack,
            Ack::Committed {
                target: EntityKey::MemoryParams,
                version: 2
            }
        );

        let stale = store.commit(params_commit(&scope, Some(1), 20.0)).await;
        assert!(matches!(
            stale,
            Err(crate::error::EvolutionError::CommitConflict { found: Some(2), .. })
        ));

        let (version, params) = store.current_memory_params(&scope).await.unwrap();
        assert_eq!(version, Some(2));
        assert_eq!(params.retention_window_days, 24.0);
        assert_eq!(store.history(&scope, &EntityKey::MemoryParams).await.unwrap().len(), 2);
        assert_eq!(store.read_audit(&scope, &EntityKey::MemoryParams).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_operations_apply_to_facts() {
        let store = InMemoryStore::new();
        let scope = Scope::default();
        let now = Utc::now();
        let fact = MemoryFact::new(scope.clone(), "likes tea", 0.8, now);
        store.append_fact(&fact).await.unwrap();

        let access = MemoryOperation::new(scope.clone(), OperationKind::Access, vec![fact.id], now);
        store.append_operation(&access).await.unwrap();

        let facts = store.read_facts(&scope, now - Duration::days(1), 10).await.unwrap();
        assert_eq!(facts[0].access_count, 1);
        let ops = store.read_operations(&scope, now - Duration::days(1), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = InMemoryStore::new();
        let a = Scope::device("a");
        let b = Scope::device("b");
        let agent = Agent::new(a.clone(), "summarizer", Utc::now());
        store.register_agent(agent.clone()).await.unwrap();

        assert_eq!(store.list_agents(&a).await.unwrap().len(), 1);
        assert!(store.list_agents(&b).await.unwrap().is_empty());
        assert!(store.current_agent(&b, agent.id).await.unwrap().is_none());
    }
}
