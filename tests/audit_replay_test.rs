//! Audit trail replay after several cycles and a rollback

mod common;

use chrono::{Duration, Utc};
use common::{approx, create_sqlite_store, seed_decaying_window, test_scope};
use observer_evolution::audit;
use observer_evolution::storage::OwnedEntity;
use observer_evolution::types::AgentStatus;
use observer_evolution::{
    Agent, EntityKey, EvolutionConfig, EvolutionOrchestrator, EvolutionStore, EvolutionSubsystem,
    InMemoryStore, OperationKind,
};
use std::sync::Arc;

async fn evolve_and_roll_back(store: Arc<dyn EvolutionStore>) {
    let scope = test_scope();
    let now = Utc::now();
    seed_decaying_window(store.as_ref(), &scope, now).await;
    let agent = Agent::new(scope.clone(), "digest", now).with_status(AgentStatus::Active);
    store.register_agent(agent.clone()).await.unwrap();

    let mut orch = EvolutionOrchestrator::new(EvolutionConfig::default(), scope.clone(), store.clone());
    for _ in 0..2 {
        let report = orch
            .trigger_immediate(EvolutionSubsystem::Memory, "scheduled tuning")
            .await;
        assert!(report
            .subsystem(EvolutionSubsystem::Memory)
            .unwrap()
            .outcome
            .is_applied());
    }

    let history = store.history(&scope, &EntityKey::MemoryParams).await.unwrap();
    let retention: Vec<f32> = history
        .iter()
        .map(|v| match &v.value {
            OwnedEntity::MemoryParams(p) => p.retention_window_days,
            other => panic!("unexpected entity {:?}", other),
        })
        .collect();
    assert_eq!(retention.len(), 2);
    assert!(approx(retention[0], 24.0));
    assert!(approx(retention[1], 19.2));

    let restored = orch
        .rollback(&EntityKey::MemoryParams, "retention too short")
        .await
        .unwrap();
    assert_eq!(restored, 3);

    let records = store.read_audit(&scope, &EntityKey::MemoryParams).await.unwrap();
    assert_eq!(
        records.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(records[0].proposal_id.is_some());
    assert!(!records[0].evidence.operations.is_empty());
    assert!(records[2].proposal_id.is_none());

    let replayed = audit::replay(&records).unwrap().unwrap();
    let current = store
        .get_current(&scope, &EntityKey::MemoryParams)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed.version, current.version);
    assert_eq!(replayed.value, current.value);
    assert_eq!(current.value, history[0].value);

    let ops = store
        .read_operations(&scope, now - Duration::days(1), 1000)
        .await
        .unwrap();
    assert_eq!(ops.iter().filter(|op| op.kind == OperationKind::Tune).count(), 2);
    assert_eq!(ops.iter().filter(|op| op.kind == OperationKind::Rollback).count(), 1);

    // Every agent evolution is replayable too
    let agent_key = EntityKey::Agent(agent.id);
    assert!(audit::verify(store.as_ref(), &scope, &agent_key).await.unwrap());
    let agent_records = store.read_audit(&scope, &agent_key).await.unwrap();
    assert!(agent_records.len() >= 2);
}

#[tokio::test]
async fn test_replay_matches_current_in_memory() {
    evolve_and_roll_back(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_replay_matches_current_in_sqlite() {
    let (_dir, store) = create_sqlite_store();
    evolve_and_roll_back(Arc::new(store)).await;
}

#[tokio::test]
async fn test_gap_in_audit_is_detected() {
    let store = InMemoryStore::new();
    let scope = test_scope();
    let now = Utc::now();
    let agent = Agent::new(scope.clone(), "gap", now);
    store.register_agent(agent.clone()).await.unwrap();

    let mut records = store
        .read_audit(&scope, &EntityKey::Agent(agent.id))
        .await
        .unwrap();
    records[0].version = 2;
    assert!(audit::replay(&records).is_err());
    assert!(audit::replay(&[]).unwrap().is_none());
}
