//! Observer Evolution - Self-evolving memory, behavior and agents
//!
//! Feedback from the surrounding service (chat, agent runs, health probes,
//! a periodic scheduler) drives three subsystems that each tune one owned,
//! versioned entity per scope:
//! - **Memory**: `MemoryParams` (decay, retention, consolidation)
//! - **Behavior**: `BehaviorProfile` (verbosity, formality, ...)
//! - **Agents**: each registered `Agent`
//!
//! # Architecture
//!
//! - **Types**: records owned by the store (facts, operations, agents, logs, patterns)
//! - **Feedback**: classification, buffering and text signal detection
//! - **Storage**: `EvolutionStore` with in-memory and SQLite backends
//! - **Evolution**: the subsystems and the `EvolutionOrchestrator`
//! - **Audit**: commit records that replay to the current version
//!
//! # Example
//!
//! ```ignore
//! use observer_evolution::{EvolutionConfig, EvolutionOrchestrator, FeedbackEvent, FeedbackSource, Scope};
//! use observer_evolution::storage::sqlite::SqliteStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::open("evolution.db")?);
//!     let mut orchestrator =
//!         EvolutionOrchestrator::new(EvolutionConfig::default(), Scope::device("laptop"), store);
//!
//!     orchestrator.ingest(
//!         FeedbackEvent::message(FeedbackSource::UserExplicit, "please be brief", chrono::Utc::now()),
//!         chrono::Utc::now(),
//!     );
//!     let report = orchestrator.run_cycle_at(chrono::Utc::now()).await;
//!     println!("{} proposals", report.proposals.len());
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod error;
pub mod evolution;
pub mod feedback;
pub mod health;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use error::{EvolutionError, Result};
pub use evolution::{
    BehaviorProfile, CyclePhase, CycleReport, EvolutionConfig, EvolutionOrchestrator,
    EvolutionPriority, EvolutionSubsystem, MemoryParams, ProposalOutcome, ProposedChange,
};
pub use feedback::{FeedbackEvent, FeedbackPayload, FeedbackSource};
pub use storage::{memory::InMemoryStore, sqlite::SqliteStore, EntityKey, EvolutionStore};
pub use types::{
    Agent, AgentId, AgentLog, AgentStatus, MemoryFact, MemoryOperation, OperationKind, Pattern,
    Scope,
};
