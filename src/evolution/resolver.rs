//! Deterministic precedence between competing changes
//!
//! One comparator orders both whole proposals (RESOLVING phase) and
//! per-field agent recommendations: higher priority first, then subsystem
//! ranking, then the more recent item, then the smaller id.

use crate::evolution::proposal::{
    EvolutionPriority, EvolutionSubsystem, ProposedChange, SubsystemRanking,
};
use crate::types::ProposalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;
use uuid::Uuid;

/// Anything that competes for application
pub trait Contender {
    fn priority(&self) -> EvolutionPriority;
    fn subsystem(&self) -> EvolutionSubsystem;
    fn created_at(&self) -> DateTime<Utc>;
    /// Final tie-break; unique per contender
    fn tiebreak(&self) -> Uuid;
}

impl Contender for ProposedChange {
    fn priority(&self) -> EvolutionPriority {
        self.priority
    }

    fn subsystem(&self) -> EvolutionSubsystem {
        self.subsystem
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn tiebreak(&self) -> Uuid {
        self.id.0
    }
}

/// `Less` means `a` takes precedence over `b`
pub fn precedence<C: Contender>(a: &C, b: &C, ranking: &SubsystemRanking) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| ranking.rank(a.subsystem()).cmp(&ranking.rank(b.subsystem())))
        .then_with(|| b.created_at().cmp(&a.created_at()))
        .then_with(|| a.tiebreak().cmp(&b.tiebreak()))
}

/// Highest-precedence contender
pub fn winner<'a, C: Contender>(candidates: &'a [C], ranking: &SubsystemRanking) -> Option<&'a C> {
    candidates.iter().min_by(|a, b| precedence(*a, *b, ranking))
}

/// A proposal that lost to a mutually exclusive one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superseded {
    pub proposal: ProposedChange,
    pub by: ProposalId,
}

/// Outcome of the RESOLVING phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Winners in commit order
    pub accepted: Vec<ProposedChange>,
    pub superseded: Vec<Superseded>,
}

/// Order proposals and drop those that lose to a proposal on the same entity
pub fn resolve(mut proposals: Vec<ProposedChange>, ranking: &SubsystemRanking) -> Resolution {
    proposals.sort_by(|a, b| precedence(a, b, ranking));

    let mut resolution = Resolution::default();
    for proposal in proposals {
        let winner = resolution
            .accepted
            .iter()
            .find(|accepted| accepted.conflicts_with(&proposal))
            .map(|accepted| accepted.id);
        match winner {
            Some(by) => {
                warn!(
                    "Proposal {} ({} {}) on {} superseded by {}",
                    proposal.id, proposal.subsystem, proposal.priority, proposal.target, by
                );
                resolution.superseded.push(Superseded { proposal, by });
            }
            None => resolution.accepted.push(proposal),
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::memory::{MemoryParams, ProposedParams, WindowStats};
    use crate::evolution::proposal::ChangePayload;
    use crate::storage::EntityKey;
    use crate::types::Scope;
    use chrono::Duration;
    use proptest::prelude::*;

    fn proposal(
        subsystem: EvolutionSubsystem,
        priority: EvolutionPriority,
        created_at: DateTime<Utc>,
    ) -> ProposedChange {
        ProposedChange::new(
            subsystem,
            priority,
            Scope::default(),
            EntityKey::MemoryParams,
            None,
            ChangePayload::Memory(ProposedParams {
                params: MemoryParams::default(),
                changes: Vec::new(),
                stats: WindowStats::default(),
            }),
            created_at,
        )
    }

    #[test]
    fn test_priority_beats_ranking() {
        let now = Utc::now();
        let ranking = SubsystemRanking::default();
        let high_behavior = proposal(EvolutionSubsystem::Behavior, EvolutionPriority::High, now);
        let low_memory = proposal(EvolutionSubsystem::Memory, EvolutionPriority::Low, now);

        let resolution = resolve(vec![low_memory.clone(), high_behavior.clone()], &ranking);
        assert_eq!(resolution.accepted.len(), 1);
        assert_eq!(resolution.accepted[0].id, high_behavior.id);
        assert_eq!(resolution.superseded[0].proposal.id, low_memory.id);
        assert_eq!(resolution.superseded[0].by, high_behavior.id);
    }

    #[test]
    fn test_ranking_then_recency() {
        let now = Utc::now();
        let ranking = SubsystemRanking::default();
        let memory = proposal(EvolutionSubsystem::Memory, EvolutionPriority::Normal, now);
        let behavior = proposal(EvolutionSubsystem::Behavior, EvolutionPriority::Normal, now);
        assert_eq!(precedence(&memory, &behavior, &ranking), Ordering::Less);

        let reversed = SubsystemRanking(vec![
            EvolutionSubsystem::Behavior,
            EvolutionSubsystem::Memory,
            EvolutionSubsystem::Agents,
        ]);
        assert_eq!(precedence(&memory, &behavior, &reversed), Ordering::Greater);

        let older = proposal(EvolutionSubsystem::Memory, EvolutionPriority::Normal, now - Duration::minutes(1));
        assert_eq!(precedence(&memory, &older, &ranking), Ordering::Less);
    }

    #[test]
    fn test_non_conflicting_proposals_all_accepted() {
        let now = Utc::now();
        let mut other = proposal(EvolutionSubsystem::Behavior, EvolutionPriority::Low, now);
        other.target = EntityKey::BehaviorProfile;
        let first = proposal(EvolutionSubsystem::Memory, EvolutionPriority::High, now);

        let resolution = resolve(vec![other.clone(), first.clone()], &SubsystemRanking::default());
        let ids: Vec<_> = resolution.accepted.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![first.id, other.id]);
        assert!(resolution.superseded.is_empty());
    }

    fn arb_priority() -> impl Strategy<Value = EvolutionPriority> {
        prop_oneof![
            Just(EvolutionPriority::Low),
            Just(EvolutionPriority::Normal),
            Just(EvolutionPriority::High),
            Just(EvolutionPriority::Critical),
        ]
    }

    fn arb_subsystem() -> impl Strategy<Value = EvolutionSubsystem> {
        prop_oneof![
            Just(EvolutionSubsystem::Memory),
            Just(EvolutionSubsystem::Behavior),
            Just(EvolutionSubsystem::Agents),
        ]
    }

    proptest! {
        #[test]
        fn prop_resolution_is_order_independent(
            specs in prop::collection::vec((arb_subsystem(), arb_priority(), 0i64..3), 1..8),
            rotate in 0usize..8,
        ) {
            let base = Utc::now();
            let proposals: Vec<_> = specs
                .iter()
                .map(|(s, p, offset)| proposal(*s, *p, base + Duration::seconds(*offset)))
                .collect();
            let ranking = SubsystemRanking::default();

            let mut shuffled = proposals.clone();
            shuffled.rotate_left(rotate % proposals.len());
            shuffled.reverse();

            let a = resolve(proposals, &ranking);
            let b = resolve(shuffled, &ranking);
            let c = resolve(a.accepted.iter().cloned().chain(a.superseded.iter().map(|s| s.proposal.clone())).collect(), &ranking);

            prop_assert_eq!(a.accepted.len(), 1);
            prop_assert_eq!(a.accepted[0].id, b.accepted[0].id);
            prop_assert_eq!(a.accepted[0].id, c.accepted[0].id);
        }

        #[test]
        fn prop_winner_has_max_priority(
            specs in prop::collection::vec((arb_subsystem(), arb_priority()), 1..8),
        ) {
            let now = Utc::now();
            let proposals: Vec<_> = specs.iter().map(|(s, p)| proposal(*s, *p, now)).collect();
            let max = proposals.iter().map(|p| p.priority).max();
            let ranking = SubsystemRanking::default();
            prop_assert_eq!(winner(&proposals, &ranking).map(|w| w.priority), max);
        }
    }
}
