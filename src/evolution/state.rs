//! Evolution cycle state machine and cycle reports

use crate::evolution::proposal::{EvolutionPriority, EvolutionSubsystem, ProposalOutcome};
use crate::feedback::FlushTrigger;
use crate::health::HealthSummary;
use crate::storage::EntityKey;
use crate::types::{CycleId, ProposalId, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of one evolution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Rest state between cycles
    #[default]
    Idle,

    /// Draining the feedback queue into the buffer
    Collecting,

    /// Subsystems compute proposals; nothing is written
    Evaluating,

    /// Proposals ordered, losers superseded
    Resolving,

    /// Winning proposals written, one transaction each
    Committing,
}

impl CyclePhase {
    /// Get the next phase in the sequence
    pub fn next(&self) -> CyclePhase {
        match self {
            CyclePhase::Idle => CyclePhase::Collecting,
            CyclePhase::Collecting => CyclePhase::Evaluating,
            CyclePhase::Evaluating => CyclePhase::Resolving,
            CyclePhase::Resolving => CyclePhase::Committing,
            CyclePhase::Committing => CyclePhase::Idle,
        }
    }

    /// Forward by one phase, or back to Idle when aborting
    pub fn can_transition_to(&self, next: &CyclePhase) -> bool {
        self.next() == *next || *next == CyclePhase::Idle
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Collecting => "collecting",
            CyclePhase::Evaluating => "evaluating",
            CyclePhase::Resolving => "resolving",
            CyclePhase::Committing => "committing",
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cycle ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum CycleTrigger {
    Flush { reason: FlushTrigger },
    Immediate { subsystem: EvolutionSubsystem, reason: String },
    Retry,
    Manual,
}

/// Per-subsystem result of the EVALUATING phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    pub subsystem: EvolutionSubsystem,
    pub priority: EvolutionPriority,
    pub outcome: ProposalOutcome,
}

/// Fate of one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: ProposalId,
    pub subsystem: EvolutionSubsystem,
    pub target: EntityKey,
    pub priority: EvolutionPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ProposalId>,
    pub outcome: ProposalOutcome,
}

/// Summary of one finished (or aborted) cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub id: CycleId,
    pub scope: Scope,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub feedback_count: usize,
    pub malformed: usize,
    pub dispatched: Vec<EvolutionSubsystem>,
    pub subsystems: Vec<SubsystemStatus>,
    pub proposals: Vec<ProposalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSummary>,
    /// Phase at which the cycle was cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<CyclePhase>,
}

impl CycleReport {
    pub fn new(scope: Scope, trigger: CycleTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            id: CycleId::new(),
            scope,
            trigger,
            started_at,
            finished_at: None,
            feedback_count: 0,
            malformed: 0,
            dispatched: Vec::new(),
            subsystems: Vec::new(),
            proposals: Vec::new(),
            health: None,
            aborted: None,
        }
    }

    pub fn applied(&self) -> impl Iterator<Item = &ProposalRecord> {
        self.proposals.iter().filter(|p| p.outcome.is_applied())
    }

    pub fn proposal(&self, id: ProposalId) -> Option<&ProposalRecord> {
        self.proposals.iter().find(|p| p.id == id)
    }

    pub fn subsystem(&self, subsystem: EvolutionSubsystem) -> Option<&SubsystemStatus> {
        self.subsystems.iter().find(|s| s.subsystem == subsystem)
    }

    pub(crate) fn record(&mut self, subsystem: EvolutionSubsystem, priority: EvolutionPriority, outcome: ProposalOutcome) {
        self.subsystems.push(SubsystemStatus {
            subsystem,
            priority,
            outcome,
        });
    }

    pub(crate) fn set_outcome(&mut self, id: ProposalId, outcome: ProposalOutcome) {
        if let Some(record) = self.proposals.iter_mut().find(|p| p.id == id) {
            record.outcome = outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_sequence() {
        let mut phase = CyclePhase::Idle;
        let mut seen = vec![phase];
        for _ in 0..5 {
            let next = phase.next();
            assert!(phase.can_transition_to(&next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                CyclePhase::Idle,
                CyclePhase::Collecting,
                CyclePhase::Evaluating,
                CyclePhase::Resolving,
                CyclePhase::Committing,
                CyclePhase::Idle,
            ]
        );
    }

    #[test]
    fn test_no_skipping_phases() {
        assert!(!CyclePhase::Collecting.can_transition_to(&CyclePhase::Committing));
        assert!(!CyclePhase::Idle.can_transition_to(&CyclePhase::Evaluating));
        assert!(CyclePhase::Resolving.can_transition_to(&CyclePhase::Idle));
    }
}
