//! Optimistic commit conflicts and retry scheduling

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{approx, seed_decaying_window, test_scope};
use observer_evolution::audit::{CommitRecord, Evidence};
use observer_evolution::evolution::CycleTrigger;
use observer_evolution::storage::{Ack, AuditEntry, Commit, OwnedEntity, Versioned};
use observer_evolution::{
    AgentLog, EntityKey, EvolutionConfig, EvolutionOrchestrator, EvolutionPriority,
    EvolutionStore, EvolutionSubsystem, FeedbackEvent, FeedbackPayload, FeedbackSource,
    InMemoryStore, MemoryFact, MemoryOperation, MemoryParams, OperationKind, Pattern,
    ProposalOutcome, Result, Scope,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Store that lets a competing writer win the next `races` MemoryParams commits
struct RacingStore {
    inner: InMemoryStore,
    races: AtomicUsize,
    retention: f32,
}

impl RacingStore {
    fn new(races: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            races: AtomicUsize::new(races),
            retention: 40.0,
        }
    }

    async fn compete(&self, commit: &Commit) -> Result<()> {
        let params = MemoryParams {
            retention_window_days: self.retention,
            ..MemoryParams::default()
        };
        let audit = MemoryOperation::new(
            commit.scope.clone(),
            OperationKind::Tune,
            Vec::new(),
            commit.committed_at(),
        )
        .with_reason("competing writer");
        let (version, _) = self.inner.current_memory_params(&commit.scope).await?;
        self.inner
            .commit(Commit::new(
                commit.scope.clone(),
                version,
                OwnedEntity::MemoryParams(params),
                AuditEntry::Operation(audit),
                None,
                Evidence::default(),
                commit.committed_at(),
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EvolutionStore for RacingStore {
    async fn get_current(
        &self,
        scope: &Scope,
        key: &EntityKey,
    ) -> Result<Option<Versioned<OwnedEntity>>> {
        self.inner.get_current(scope, key).await
    }

    async fn history(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<Versioned<OwnedEntity>>> {
        self.inner.history(scope, key).await
    }

    async fn list_current(&self, scope: &Scope) -> Result<Vec<Versioned<OwnedEntity>>> {
        self.inner.list_current(scope).await
    }

    async fn commit(&self, commit: Commit) -> Result<Ack> {
        let racing = commit.target() == EntityKey::MemoryParams
            && self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if racing {
            self.compete(&commit).await?;
        }
        self.inner.commit(commit).await
    }

    async fn append_fact(&self, fact: &MemoryFact) -> Result<Ack> {
        self.inner.append_fact(fact).await
    }

    async fn read_facts(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        self.inner.read_facts(scope, since, limit).await
    }

    async fn append_operation(&self, op: &MemoryOperation) -> Result<Ack> {
        self.inner.append_operation(op).await
    }

    async fn read_operations(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryOperation>> {
        self.inner.read_operations(scope, since, limit).await
    }

    async fn append_agent_log(&self, log: &AgentLog) -> Result<Ack> {
        self.inner.append_agent_log(log).await
    }

    async fn read_agent_logs(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AgentLog>> {
        self.inner.read_agent_logs(scope, since, limit).await
    }

    async fn upsert_pattern(&self, pattern: &Pattern) -> Result<Ack> {
        self.inner.upsert_pattern(pattern).await
    }

    async fn read_patterns(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        self.inner.read_patterns(scope, since, limit).await
    }

    async fn read_audit(&self, scope: &Scope, key: &EntityKey) -> Result<Vec<CommitRecord>> {
        self.inner.read_audit(scope, key).await
    }
}

fn health_alert(now: DateTime<Utc>) -> FeedbackEvent {
    FeedbackEvent::new(
        FeedbackSource::SystemHealth,
        FeedbackPayload::HealthMetric {
            name: "retrieval_latency_ms".to_string(),
            value: 850.0,
        },
        now,
    )
    .with_priority(EvolutionPriority::High)
}

async fn tune_operations(store: &dyn EvolutionStore, scope: &Scope, now: DateTime<Utc>) -> usize {
    store
        .read_operations(scope, now - Duration::days(1), 1000)
        .await
        .unwrap()
        .iter()
        .filter(|op| op.kind == OperationKind::Tune)
        .count()
}

#[tokio::test]
async fn test_conflicting_commit_is_retried_next_cycle() {
    let store = Arc::new(RacingStore::new(1));
    let scope = test_scope();
    let now = Utc::now();
    seed_decaying_window(store.as_ref(), &scope, now).await;

    let mut orch = EvolutionOrchestrator::new(EvolutionConfig::default(), scope.clone(), store.clone());
    orch.ingest(health_alert(now), now);
    let first = orch.run_cycle_at(now).await;

    let memory = first
        .proposals
        .iter()
        .find(|p| p.target == EntityKey::MemoryParams)
        .unwrap();
    assert_eq!(memory.outcome, ProposalOutcome::RetryScheduled { attempt: 1 });
    assert_eq!(
        first.subsystem(EvolutionSubsystem::Memory).unwrap().outcome,
        ProposalOutcome::RetryScheduled { attempt: 1 }
    );

    // Only the competing writer's version exists
    let (version, params) = store.current_memory_params(&scope).await.unwrap();
    assert_eq!(version, Some(1));
    assert!(approx(params.retention_window_days, 40.0));
    assert_eq!(store.read_audit(&scope, &EntityKey::MemoryParams).await.unwrap().len(), 1);
    assert_eq!(tune_operations(store.as_ref(), &scope, now).await, 1);

    let second = orch.run_cycle_at(now).await;
    assert_eq!(second.trigger, CycleTrigger::Retry);
    assert_eq!(second.dispatched, vec![EvolutionSubsystem::Memory]);
    let retried = second
        .proposals
        .iter()
        .find(|p| p.target == EntityKey::MemoryParams)
        .unwrap();
    assert_eq!(retried.retry_of, Some(memory.id));
    assert_eq!(retried.priority, EvolutionPriority::High);
    assert_eq!(retried.outcome, ProposalOutcome::Applied { version: 2 });

    // Re-evaluated against the competitor's value, not the stale one
    let (version, params) = store.current_memory_params(&scope).await.unwrap();
    assert_eq!(version, Some(2));
    assert!(approx(params.retention_window_days, 32.0));
    assert!(observer_evolution::audit::verify(store.as_ref(), &scope, &EntityKey::MemoryParams)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let store = Arc::new(RacingStore::new(usize::MAX));
    let scope = test_scope();
    let now = Utc::now();
    seed_decaying_window(store.as_ref(), &scope, now).await;

    let mut config = EvolutionConfig::default();
    config.cycle.max_retry_attempts = 1;
    let mut orch = EvolutionOrchestrator::new(config, scope.clone(), store.clone());
    orch.ingest(health_alert(now), now);

    let first = orch.run_cycle_at(now).await;
    assert!(first
        .proposals
        .iter()
        .any(|p| p.outcome == ProposalOutcome::RetryScheduled { attempt: 1 }));

    let second = orch.run_cycle_at(now).await;
    assert_eq!(second.trigger, CycleTrigger::Retry);
    let memory = second
        .proposals
        .iter()
        .find(|p| p.target == EntityKey::MemoryParams)
        .unwrap();
    assert!(matches!(memory.outcome, ProposalOutcome::Failed { .. }));

    let third = orch.run_cycle_at(now).await;
    assert_eq!(third.trigger, CycleTrigger::Manual);
    assert!(third.dispatched.is_empty());
}
