//! Common test utilities and helpers

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use observer_evolution::{
    Agent, AgentStatus, EvolutionStore, MemoryFact, MemoryOperation, OperationKind, Scope,
    SqliteStore,
};
use tempfile::TempDir;

pub fn test_scope() -> Scope {
    Scope::session("integration")
}

/// SQLite store in a temporary directory; keep the TempDir alive
pub fn create_sqlite_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = SqliteStore::open(dir.path().join("evolution.db")).expect("Failed to open store");
    (dir, store)
}

/// Seed a window where most facts are decaying unused
///
/// 45 low-confidence facts are never read, 5 strong facts take all 40
/// accesses. Memory evolution answers with a shorter retention window.
pub async fn seed_decaying_window(store: &dyn EvolutionStore, scope: &Scope, now: DateTime<Utc>) {
    let created = now - Duration::days(5);
    let mut hot = Vec::new();
    for i in 0..45 {
        let fact = MemoryFact::new(scope.clone(), format!("cold fact {}", i), 0.3, created);
        store.append_fact(&fact).await.expect("append cold fact");
    }
    for i in 0..5 {
        let fact = MemoryFact::new(scope.clone(), format!("hot fact {}", i), 0.9, created);
        store.append_fact(&fact).await.expect("append hot fact");
        hot.push(fact.id);
    }
    for i in 0..40 {
        let op = MemoryOperation::new(
            scope.clone(),
            OperationKind::Access,
            vec![hot[i % hot.len()]],
            now - Duration::hours(i as i64),
        );
        store.append_operation(&op).await.expect("append access");
    }
}

/// Register an active agent as version 1
pub async fn register_active_agent(
    store: &dyn EvolutionStore,
    scope: &Scope,
    name: &str,
    now: DateTime<Utc>,
) -> Agent {
    let agent = Agent::new(scope.clone(), name, now).with_status(AgentStatus::Active);
    store
        .register_agent(agent.clone())
        .await
        .expect("register agent");
    agent
}

pub fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}
