//! Behavior evolution
//!
//! Turns feedback and agent execution logs into [`Pattern`]s and proposes
//! adjustments to the scope's [`BehaviorProfile`], one per parameter.

use crate::audit::Evidence;
use crate::error::{EvolutionError, Result};
use crate::evolution::agent::{Adjustment, AgentField, Recommendation};
use crate::evolution::config::BehaviorEvolutionConfig;
use crate::evolution::proposal::{EvolutionPriority, EvolutionSubsystem, ParamChange, ProposedChange};
use crate::feedback::{signals, FeedbackEvent, FeedbackPayload, TextSignal};
use crate::storage::{AuditEntry, Commit, OwnedEntity};
use crate::types::{AgentId, AgentLog, AgentLogKind, LogLevel, Pattern, PatternId, PatternKind, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Scope-wide assistant behavior on a 0..1 scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorProfile {
    /// 0 = concise, 1 = detailed
    pub verbosity: f32,
    /// 0 = act without asking, 1 = always confirm
    pub ask_threshold: f32,
    /// 0 = casual, 1 = formal
    pub formality: f32,
    pub proactivity: f32,
    pub emoji_usage: f32,
    pub code_detail: f32,
    /// 0 = English, 1 = Russian
    pub language_mix: f32,
    pub context_retention: f32,
}

impl Default for BehaviorProfile {
    fn default() -> Self {
        Self {
            verbosity: 0.5,
            ask_threshold: 0.5,
            formality: 0.5,
            proactivity: 0.5,
            emoji_usage: 0.0,
            code_detail: 0.6,
            language_mix: 0.3,
            context_retention: 0.5,
        }
    }
}

impl BehaviorProfile {
    pub fn get(&self, param: BehaviorParam) -> f32 {
        match param {
            BehaviorParam::Verbosity => self.verbosity,
            BehaviorParam::AskThreshold => self.ask_threshold,
            BehaviorParam::Formality => self.formality,
            BehaviorParam::Proactivity => self.proactivity,
            BehaviorParam::EmojiUsage => self.emoji_usage,
            BehaviorParam::CodeDetail => self.code_detail,
            BehaviorParam::LanguageMix => self.language_mix,
            BehaviorParam::ContextRetention => self.context_retention,
        }
    }

    pub fn set(&mut self, param: BehaviorParam, value: f32) {
        let value = value.clamp(0.0, 1.0);
        match param {
            BehaviorParam::Verbosity => self.verbosity = value,
            BehaviorParam::AskThreshold => self.ask_threshold = value,
            BehaviorParam::Formality => self.formality = value,
            BehaviorParam::Proactivity => self.proactivity = value,
            BehaviorParam::EmojiUsage => self.emoji_usage = value,
            BehaviorParam::CodeDetail => self.code_detail = value,
            BehaviorParam::LanguageMix => self.language_mix = value,
            BehaviorParam::ContextRetention => self.context_retention = value,
        }
    }

    /// System-prompt addendum describing the current profile
    pub fn prompt_modifier(&self) -> String {
        let mut lines = Vec::new();

        if self.verbosity < 0.3 {
            lines.push("Keep answers short and to the point.");
        } else if self.verbosity > 0.7 {
            lines.push("Give thorough answers with full explanations.");
        }
        if self.ask_threshold < 0.3 {
            lines.push("Act on reasonable assumptions instead of asking for confirmation.");
        } else if self.ask_threshold > 0.7 {
            lines.push("Confirm with the user before taking significant actions.");
        }
        if self.formality < 0.3 {
            lines.push("Use a relaxed, friendly tone.");
        } else if self.formality > 0.7 {
            lines.push("Use a professional, formal tone.");
        }
        if self.proactivity < 0.3 {
            lines.push("Answer the question asked without suggesting extra work.");
        } else if self.proactivity > 0.7 {
            lines.push("Suggest related improvements and next steps.");
        }
        if self.code_detail < 0.3 {
            lines.push("Keep code minimal with few comments.");
        } else if self.code_detail > 0.7 {
            lines.push("Comment code and explain the reasoning behind it.");
        }
        if self.language_mix > 0.6 {
            lines.push("Reply primarily in Russian.");
        } else if self.language_mix < 0.2 {
            lines.push("Reply in English.");
        }
        if self.context_retention > 0.7 {
            lines.push("Refer back to facts the user shared earlier.");
        }
        if self.emoji_usage < 0.1 {
            lines.push("Do not use emojis.");
        }

        lines.join("\n")
    }
}

/// One behavior profile parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorParam {
    Verbosity,
    AskThreshold,
    Formality,
    Proactivity,
    EmojiUsage,
    CodeDetail,
    LanguageMix,
    ContextRetention,
}

impl BehaviorParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorParam::Verbosity => "verbosity",
            BehaviorParam::AskThreshold => "ask_threshold",
            BehaviorParam::Formality => "formality",
            BehaviorParam::Proactivity => "proactivity",
            BehaviorParam::EmojiUsage => "emoji_usage",
            BehaviorParam::CodeDetail => "code_detail",
            BehaviorParam::LanguageMix => "language_mix",
            BehaviorParam::ContextRetention => "context_retention",
        }
    }
}

/// Parameter and step implied by a pattern kind
fn rule(kind: PatternKind) -> (BehaviorParam, f32) {
    match kind {
        PatternKind::BrevityRequest => (BehaviorParam::Verbosity, -0.15),
        PatternKind::DetailRequest => (BehaviorParam::Verbosity, 0.15),
        PatternKind::NegativeFeedback => (BehaviorParam::AskThreshold, 0.10),
        PatternKind::PositiveFeedback => (BehaviorParam::AskThreshold, -0.05),
        PatternKind::FormalityRequest => (BehaviorParam::Formality, 0.15),
        PatternKind::CasualRequest => (BehaviorParam::Formality, -0.15),
        PatternKind::Forgetfulness => (BehaviorParam::ContextRetention, 0.15),
        PatternKind::RecurringFailure => (BehaviorParam::Proactivity, -0.10),
    }
}

fn signal_kind(signal: TextSignal) -> PatternKind {
    match signal {
        TextSignal::Positive => PatternKind::PositiveFeedback,
        TextSignal::Negative => PatternKind::NegativeFeedback,
        TextSignal::Brevity => PatternKind::BrevityRequest,
        TextSignal::Detail => PatternKind::DetailRequest,
        TextSignal::Formal => PatternKind::FormalityRequest,
        TextSignal::Casual => PatternKind::CasualRequest,
        TextSignal::Forgetfulness => PatternKind::Forgetfulness,
    }
}

fn pattern_key(kind: PatternKind, agent_id: Option<AgentId>) -> String {
    match agent_id {
        Some(id) => format!("{}:{}", kind.as_str(), id),
        None => kind.as_str().to_string(),
    }
}

/// Adjustment of one parameter, backed by one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedBehaviorChange {
    pub parameter: BehaviorParam,
    pub from: f32,
    pub to: f32,
    pub pattern_id: PatternId,
    pub pattern_key: String,
    pub support: u32,
    pub confidence: f32,
    pub last_seen_at: DateTime<Utc>,
    pub evidence: Evidence,
}

impl ProposedBehaviorChange {
    /// Higher confidence first, then the most recent pattern, then key
    fn precedence(a: &Self, b: &Self) -> Ordering {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
            .then_with(|| a.pattern_key.cmp(&b.pattern_key))
    }

    pub fn as_param_change(&self) -> ParamChange {
        ParamChange::new(
            self.parameter.as_str(),
            self.from as f64,
            self.to as f64,
            format!(
                "pattern {} (support {}, confidence {:.2})",
                self.pattern_key, self.support, self.confidence
            ),
        )
    }
}

/// Profile proposed from a set of per-parameter changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorUpdate {
    pub profile: BehaviorProfile,
    pub changes: Vec<ProposedBehaviorChange>,
    /// Patterns persisted together with the profile
    pub patterns: Vec<Pattern>,
}

impl BehaviorUpdate {
    /// Apply changes on top of the current profile; None when nothing changes
    pub fn from_changes(
        current: &BehaviorProfile,
        changes: Vec<ProposedBehaviorChange>,
        patterns: Vec<Pattern>,
    ) -> Option<Self> {
        if changes.is_empty() {
            return None;
        }
        let mut profile = current.clone();
        for change in &changes {
            profile.set(change.parameter, change.to);
        }
        Some(Self {
            profile,
            changes,
            patterns,
        })
    }

    pub fn evidence(&self) -> Evidence {
        let mut evidence = Evidence::default();
        for change in &self.changes {
            evidence.merge(&change.evidence);
        }
        evidence
    }

    /// Agent-level recommendations implied by this update
    pub fn recommendations(
        &self,
        priority: EvolutionPriority,
        proposal: &ProposedChange,
    ) -> Vec<Recommendation> {
        self.changes
            .iter()
            .filter_map(|change| {
                let (field, adjustment) = match change.parameter {
                    BehaviorParam::Verbosity => (AgentField::Verbosity, Adjustment::Set(change.to as f64)),
                    BehaviorParam::AskThreshold => {
                        (AgentField::AskThreshold, Adjustment::Set(change.to as f64))
                    }
                    BehaviorParam::ContextRetention => {
                        let factor = if change.to > change.from { 1.25 } else { 0.8 };
                        (AgentField::RetentionDays, Adjustment::Scale(factor))
                    }
                    _ => return None,
                };
                Some(
                    Recommendation::new(
                        EvolutionSubsystem::Behavior,
                        priority,
                        field,
                        adjustment,
                        format!("{} pattern", change.pattern_key),
                        proposal.created_at,
                    )
                    .with_proposal(proposal.id),
                )
            })
            .collect()
    }
}

/// Output of one behavior evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BehaviorEvaluation {
    /// Winning change per parameter
    pub proposals: Vec<ProposedBehaviorChange>,
    /// Changes that lost a same-parameter tie-break
    pub superseded: Vec<ProposedBehaviorChange>,
    /// Patterns created or updated by this window
    pub patterns: Vec<Pattern>,
    pub signals: usize,
    /// Malformed feedback entries dropped
    pub skipped: usize,
}

#[derive(Default)]
struct Observation {
    kind: Option<PatternKind>,
    agent_id: Option<AgentId>,
    support: u32,
    last_seen_at: Option<DateTime<Utc>>,
    evidence: Evidence,
}

/// Count one sighting of a pattern and return its evidence for the caller to extend
fn observe(
    observed: &mut BTreeMap<String, Observation>,
    kind: PatternKind,
    agent_id: Option<AgentId>,
    at: DateTime<Utc>,
) -> &mut Evidence {
    let entry = observed.entry(pattern_key(kind, agent_id)).or_default();
    entry.kind = Some(kind);
    entry.agent_id = agent_id;
    entry.support += 1;
    entry.last_seen_at = Some(entry.last_seen_at.map_or(at, |t| t.max(at)));
    &mut entry.evidence
}

/// Behavior evolution subsystem
pub struct BehaviorEvolution {
    config: BehaviorEvolutionConfig,
}

impl BehaviorEvolution {
    pub fn new(config: BehaviorEvolutionConfig) -> Self {
        Self { config }
    }

    fn confidence(&self, support: u32) -> f32 {
        support as f32 / (support as f32 + self.config.confidence_prior)
    }

    /// Detect patterns in a window and propose profile adjustments
    pub fn evaluate(
        &self,
        scope: &Scope,
        agent_logs: &[AgentLog],
        feedback: &[FeedbackEvent],
        known: &[Pattern],
        current: &BehaviorProfile,
    ) -> Result<BehaviorEvaluation> {
        if agent_logs.is_empty() && feedback.is_empty() {
            return Err(EvolutionError::InsufficientData {
                subsystem: EvolutionSubsystem::Behavior,
                reason: "no feedback or agent logs in window".to_string(),
            });
        }

        let mut evaluation = BehaviorEvaluation::default();
        let mut observed: BTreeMap<String, Observation> = BTreeMap::new();

        for event in feedback {
            let (_, timestamp) = match event.validate() {
                Ok(valid) => valid,
                Err(e) => {
                    warn!("Skipping feedback: {}", e);
                    evaluation.skipped += 1;
                    continue;
                }
            };

            let mut kinds: Vec<(PatternKind, Option<AgentId>)> = event
                .text()
                .map(signals::detect)
                .unwrap_or_default()
                .into_iter()
                .map(|s| (signal_kind(s), None))
                .collect();
            match &event.payload {
                FeedbackPayload::Rating { positive: true, .. } => {
                    kinds.push((PatternKind::PositiveFeedback, None))
                }
                FeedbackPayload::Rating { positive: false, .. } => {
                    kinds.push((PatternKind::NegativeFeedback, None))
                }
                FeedbackPayload::AgentOutcome {
                    agent_id,
                    success: false,
                    ..
                } => kinds.push((PatternKind::RecurringFailure, Some(*agent_id))),
                _ => {}
            }
            kinds.sort();
            kinds.dedup();

            for (kind, agent_id) in kinds {
                debug!("Feedback {} signals {}", event.id, kind.as_str());
                evaluation.signals += 1;
                observe(&mut observed, kind, agent_id, timestamp)
                    .feedback
                    .push(event.id);
            }
        }

        for log in agent_logs {
            if let (Some(false), Some(agent_id)) = (log.execution_success(), log.agent_id) {
                observe(&mut observed, PatternKind::RecurringFailure, Some(agent_id), log.created_at)
                    .agent_logs
                    .push(log.id);
            }
        }

        let known: HashMap<&str, &Pattern> = known.iter().map(|p| (p.key.as_str(), p)).collect();
        let mut candidates: BTreeMap<BehaviorParam, Vec<ProposedBehaviorChange>> = BTreeMap::new();

        for (key, obs) in observed {
            let (Some(kind), Some(last_seen_at)) = (obs.kind, obs.last_seen_at) else {
                continue;
            };
            let previous = known.get(key.as_str());
            // Failures are re-read from the log window every cycle, so they do not accumulate
            let support = match (kind, previous) {
                (PatternKind::RecurringFailure, _) | (_, None) => obs.support,
                (_, Some(p)) => p.support + obs.support,
            };
            let pattern = Pattern {
                id: previous.map(|p| p.id).unwrap_or_default(),
                scope: scope.clone(),
                key: key.clone(),
                kind,
                agent_id: obs.agent_id,
                support,
                confidence: self.confidence(support),
                first_seen_at: previous.map(|p| p.first_seen_at).unwrap_or(last_seen_at),
                last_seen_at: previous
                    .map(|p| p.last_seen_at.max(last_seen_at))
                    .unwrap_or(last_seen_at),
            };

            if let Some(change) = self.propose(&pattern, obs.evidence, current) {
                candidates.entry(change.parameter).or_default().push(change);
            }
            evaluation.patterns.push(pattern);
        }

        for (param, mut changes) in candidates {
            changes.sort_by(ProposedBehaviorChange::precedence);
            let mut changes = changes.into_iter();
            if let Some(winner) = changes.next() {
                for loser in changes {
                    debug!(
                        "{} change from {} superseded by {}",
                        param.as_str(),
                        loser.pattern_key,
                        winner.pattern_key
                    );
                    evaluation.superseded.push(loser);
                }
                evaluation.proposals.push(winner);
            }
        }

        Ok(evaluation)
    }

    fn propose(
        &self,
        pattern: &Pattern,
        mut evidence: Evidence,
        current: &BehaviorProfile,
    ) -> Option<ProposedBehaviorChange> {
        if pattern.support < self.config.min_support
            || pattern.confidence < self.config.min_confidence
        {
            debug!(
                "Pattern {} below thresholds (support {}, confidence {:.2})",
                pattern.key, pattern.support, pattern.confidence
            );
            return None;
        }

        let (parameter, step) = rule(pattern.kind);
        if step.abs() > self.config.max_adjustment {
            debug!("Rejecting {} step {} over max_adjustment", parameter.as_str(), step);
            return None;
        }

        let from = current.get(parameter);
        let to = ((from + step).clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
        if (to - from).abs() < f32::EPSILON {
            return None;
        }

        evidence.patterns.push(pattern.id);
        Some(ProposedBehaviorChange {
            parameter,
            from,
            to,
            pattern_id: pattern.id,
            pattern_key: pattern.key.clone(),
            support: pattern.support,
            confidence: pattern.confidence,
            last_seen_at: pattern.last_seen_at,
            evidence,
        })
    }

    /// Commit writing the updated profile together with its patterns
    pub fn commit_for(change: &ProposedChange, update: &BehaviorUpdate, now: DateTime<Utc>) -> Commit {
        let param_changes: Vec<ParamChange> =
            update.changes.iter().map(|c| c.as_param_change()).collect();
        let message = format!(
            "Behavior adjusted: {}",
            param_changes
                .iter()
                .map(|c| format!("{} {:.2} -> {:.2}", c.name, c.from, c.to))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let log = AgentLog::new(
            None,
            change.scope.clone(),
            LogLevel::Info,
            message,
            AgentLogKind::BehaviorAdjusted {
                changes: param_changes,
            },
            now,
        );
        Commit::new(
            change.scope.clone(),
            change.base_version,
            OwnedEntity::BehaviorProfile(update.profile.clone()),
            AuditEntry::AgentLog(log),
            Some(change.id),
            change.triggers.clone(),
            now,
        )
        .with_patterns(update.patterns.clone())
    }
}
