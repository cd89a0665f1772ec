// Evolution Module - Self-tuning of memory, behavior and agents
//
// Each subsystem evaluates a bounded window of history and proposes a change
// to the one entity it owns. The orchestrator resolves competing proposals
// and commits the winners with a version check.
//
// Components:
// - memory: MemoryParams tuning from fact access statistics
// - behavior: BehaviorProfile adjustment from feedback patterns
// - agent: Agent versions merged from upstream recommendations
// - resolver: Priority comparator shared by proposals and recommendations
// - orchestrator: Cycle driver (collect, evaluate, resolve, commit)

pub mod agent;
pub mod behavior;
pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod proposal;
pub mod resolver;
pub mod state;

pub use agent::{
    Adjustment, AgentEvaluation, AgentEvolution, AgentField, Lineage, ProposedAgentVersion,
    Recommendation, RecommendationOutcome,
};
pub use behavior::{
    BehaviorEvaluation, BehaviorEvolution, BehaviorParam, BehaviorProfile, BehaviorUpdate,
    ProposedBehaviorChange,
};
pub use config::{ConfigError, EvolutionConfig};
pub use memory::{MemoryEvolution, MemoryParams, ProposedParams, WindowStats};
pub use orchestrator::EvolutionOrchestrator;
pub use proposal::{
    ChangePayload, EvolutionPriority, EvolutionSubsystem, ParamChange, ProposalOutcome,
    ProposedChange, SubsystemRanking,
};
pub use resolver::{precedence, resolve, Resolution, Superseded};
pub use state::{CyclePhase, CycleReport, CycleTrigger, ProposalRecord, SubsystemStatus};
