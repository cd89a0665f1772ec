//! Evolution orchestrator
//!
//! Drives one cycle per flush of the feedback buffer:
//! IDLE -> COLLECTING -> EVALUATING -> RESOLVING -> COMMITTING -> IDLE.
//! Nothing is written before COMMITTING, so a cycle cancelled between
//! phases leaves the store untouched and puts its feedback back in the
//! buffer.

use crate::audit::Evidence;
use crate::error::{EvolutionError, Result};
use crate::evolution::agent::{
    AgentEvaluation, AgentEvolution, Lineage, ProposedAgentVersion, Recommendation,
};
use crate::evolution::behavior::{BehaviorEvaluation, BehaviorEvolution, BehaviorUpdate};
use crate::evolution::config::EvolutionConfig;
use crate::evolution::memory::MemoryEvolution;
use crate::evolution::proposal::{
    ChangePayload, EvolutionPriority, EvolutionSubsystem, ProposalOutcome, ProposedChange,
};
use crate::evolution::resolver;
use crate::evolution::state::{CyclePhase, CycleReport, CycleTrigger, ProposalRecord};
use crate::feedback::{BufferedFeedback, FeedbackBuffer, FeedbackEvent, FeedbackQueue, FeedbackSender, FlushTrigger};
use crate::health::{self, HealthSummary};
use crate::storage::{Ack, AuditEntry, Commit, EntityKey, EvolutionStore, Versioned};
use crate::types::{
    Agent, AgentLog, AgentLogKind, AgentStatus, LogLevel, MemoryOperation, OperationKind, Pattern,
    ProposalId, Scope,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Subsystem whose commit must be re-evaluated next cycle
#[derive(Debug, Clone)]
struct RetryTicket {
    subsystem: EvolutionSubsystem,
    target: EntityKey,
    priority: EvolutionPriority,
    attempt: u32,
    proposal_id: ProposalId,
    feedback: Vec<FeedbackEvent>,
    /// Upstream recommendations for agent targets
    recommendations: Vec<Recommendation>,
}

/// Work routed to one subsystem for this cycle
#[derive(Debug, Clone)]
struct Dispatch {
    priority: EvolutionPriority,
    feedback: Vec<FeedbackEvent>,
    retries: Vec<RetryTicket>,
}

impl Dispatch {
    fn new(priority: EvolutionPriority) -> Self {
        Self {
            priority,
            feedback: Vec::new(),
            retries: Vec::new(),
        }
    }

    fn raise(&mut self, priority: EvolutionPriority) {
        self.priority = self.priority.max(priority);
    }

    fn add_feedback(&mut self, event: &FeedbackEvent) {
        if !self.feedback.iter().any(|e| e.id == event.id) {
            self.feedback.push(event.clone());
        }
    }

    fn retry_for(&self, target: &EntityKey) -> Option<&RetryTicket> {
        self.retries.iter().find(|t| t.target == *target)
    }

    fn retry_of(&self, target: &EntityKey) -> Option<ProposalId> {
        self.retry_for(target).map(|t| t.proposal_id)
    }

    fn feedback_ids(&self) -> Evidence {
        Evidence {
            feedback: self.feedback.iter().map(|e| e.id).collect(),
            ..Evidence::default()
        }
    }
}

type Plan = BTreeMap<EvolutionSubsystem, Dispatch>;

/// Inputs taken out of the orchestrator at cycle start, restored on abort
struct Pending {
    batch: Vec<BufferedFeedback>,
    retries: Vec<RetryTicket>,
    forced: HashMap<EvolutionSubsystem, EvolutionPriority>,
}

#[derive(Default)]
struct Evaluated {
    proposals: Vec<ProposedChange>,
    /// Patterns detected by behavior evolution this cycle
    patterns: Vec<Pattern>,
    /// Evaluated behavior proposal that persists `patterns`
    behavior_proposal: Option<ProposalId>,
    /// Evaluated memory and behavior proposals agents were merged against
    upstream: HashSet<ProposalId>,
    agents: Vec<AgentInputs>,
}

/// One agent's merge inputs, settled again once upstream commits are known
struct AgentInputs {
    current: Versioned<Agent>,
    priority: EvolutionPriority,
    /// Upstream recommendations, including those carried by a retry ticket
    carried: Vec<Recommendation>,
    /// Performance and failure pattern recommendations
    own: Vec<Recommendation>,
    triggers: Evidence,
    retry_of: Option<ProposalId>,
    /// Proposal built during EVALUATING
    proposal: Option<ProposalId>,
}

#[derive(Default)]
struct AgentsEvaluated {
    proposals: Vec<ProposedChange>,
    inputs: Vec<AgentInputs>,
}

/// Coordinates memory, behavior and agent evolution for one scope
pub struct EvolutionOrchestrator {
    config: EvolutionConfig,
    scope: Scope,
    store: Arc<dyn EvolutionStore>,
    memory: MemoryEvolution,
    behavior: BehaviorEvolution,
    agents: AgentEvolution,
    buffer: FeedbackBuffer,
    queue: FeedbackQueue,
    phase: CyclePhase,
    retries: Vec<RetryTicket>,
    submitted: Vec<ProposedChange>,
    forced: HashMap<EvolutionSubsystem, EvolutionPriority>,
    history: VecDeque<CycleReport>,
    shutdown: CancellationToken,
    #[cfg(test)]
    phase_hook: Option<Box<dyn Fn(CyclePhase) + Send + Sync>>,
}

impl EvolutionOrchestrator {
    pub fn new(config: EvolutionConfig, scope: Scope, store: Arc<dyn EvolutionStore>) -> Self {
        Self {
            memory: MemoryEvolution::new(config.memory.clone()),
            behavior: BehaviorEvolution::new(config.behavior.clone()),
            agents: AgentEvolution::new(config.agents.clone()),
            buffer: FeedbackBuffer::new(config.buffer.clone()),
            queue: FeedbackQueue::new(),
            phase: CyclePhase::Idle,
            retries: Vec::new(),
            submitted: Vec::new(),
            forced: HashMap::new(),
            history: VecDeque::new(),
            shutdown: CancellationToken::new(),
            #[cfg(test)]
            phase_hook: None,
            config,
            scope,
            store,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Finished cycle reports, oldest first
    pub fn history(&self) -> impl Iterator<Item = &CycleReport> {
        self.history.iter()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Handle for producers on other tasks
    pub fn feedback_sender(&self) -> FeedbackSender {
        self.queue.get_sender()
    }

    /// Token that stops [`run`](Self::run) and aborts an in-flight cycle between phases
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Classify and buffer one event
    pub fn ingest(&mut self, event: FeedbackEvent, now: DateTime<Utc>) -> Option<FlushTrigger> {
        let priority = event.classify(&self.config.priorities);
        debug!("Buffered feedback {} at {}", event.id, priority);
        self.buffer.push(BufferedFeedback {
            event,
            priority,
            received_at: now,
        });
        self.buffer.flush_trigger(now)
    }

    /// Queue an externally built proposal for the next RESOLVING phase
    pub fn submit(&mut self, proposal: ProposedChange) {
        info!(
            "Submitted proposal {} ({} {}) on {}",
            proposal.id, proposal.subsystem, proposal.priority, proposal.target
        );
        self.submitted.push(proposal);
    }

    /// Inspect the buffer after draining the queue
    pub async fn flush_trigger(&mut self, now: DateTime<Utc>) -> Option<FlushTrigger> {
        self.collect_queue(now).await;
        self.buffer.flush_trigger(now)
    }

    /// Run a critical cycle for one subsystem right away
    pub async fn trigger_immediate(
        &mut self,
        subsystem: EvolutionSubsystem,
        reason: impl Into<String>,
    ) -> CycleReport {
        let reason = reason.into();
        warn!("Immediate evolution of {}: {}", subsystem, reason);
        self.forced.insert(subsystem, EvolutionPriority::Critical);
        self.run_cycle(CycleTrigger::Immediate { subsystem, reason }, Utc::now())
            .await
    }

    /// Run one cycle now regardless of the flush trigger
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        let trigger = match self.flush_trigger(now).await {
            Some(reason) => CycleTrigger::Flush { reason },
            None if !self.retries.is_empty() => CycleTrigger::Retry,
            None => CycleTrigger::Manual,
        };
        self.run_cycle(trigger, now).await
    }

    /// Poll the buffer every `poll_interval` until shut down
    pub async fn run(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("Evolution disabled for {}", self.scope);
            return Ok(());
        }

        let mut interval = tokio::time::interval(self.config.cycle.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();
        info!(
            "Evolution orchestrator started for {} (poll every {:?})",
            self.scope, self.config.cycle.poll_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Evolution orchestrator for {} stopping", self.scope);
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    let trigger = match self.flush_trigger(now).await {
                        Some(reason) => Some(CycleTrigger::Flush { reason }),
                        None if !self.retries.is_empty() => Some(CycleTrigger::Retry),
                        None if !self.submitted.is_empty() => Some(CycleTrigger::Manual),
                        None => None,
                    };
                    if let Some(trigger) = trigger {
                        self.run_cycle(trigger, now).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Restore the version before the current one as a new version
    pub async fn rollback(&self, key: &EntityKey, reason: &str) -> Result<u64> {
        self.rollback_at(key, reason, Utc::now()).await
    }

    async fn rollback_at(&self, key: &EntityKey, reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let history = self.store.history(&self.scope, key).await?;
        let [.., previous, current] = history.as_slice() else {
            return Err(EvolutionError::NotFound(format!(
                "No earlier version of {} to roll back to",
                key
            )));
        };

        let message = format!(
            "Rolled back {} from v{} to the value of v{}: {}",
            key, current.version, previous.version, reason
        );
        let audit = match key {
            EntityKey::MemoryParams => AuditEntry::Operation(
                MemoryOperation::new(self.scope.clone(), OperationKind::Rollback, Vec::new(), now)
                    .with_reason(message.clone()),
            ),
            EntityKey::BehaviorProfile | EntityKey::Agent(_) => {
                let agent_id = match key {
                    EntityKey::Agent(id) => Some(*id),
                    _ => None,
                };
                AuditEntry::AgentLog(AgentLog::new(
                    agent_id,
                    self.scope.clone(),
                    LogLevel::Warning,
                    message.clone(),
                    AgentLogKind::Rollback {
                        restored_version: previous.version,
                    },
                    now,
                ))
            }
        };

        let commit = Commit::new(
            self.scope.clone(),
            Some(current.version),
            previous.value.clone(),
            audit,
            None,
            Evidence::default(),
            now,
        );
        let version = commit.next_version();
        let version = match self.store.commit(commit).await? {
            Ack::Committed { version, .. } => version,
            Ack::Appended { .. } => version,
        };
        warn!("{}", message);
        Ok(version)
    }

    fn enter(&mut self, next: CyclePhase) {
        debug_assert!(self.phase.can_transition_to(&next));
        debug!("Cycle phase {} -> {}", self.phase, next);
        self.phase = next;
        #[cfg(test)]
        if let Some(hook) = &self.phase_hook {
            hook(next);
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::from_std(self.config.cycle.window).unwrap_or_else(|_| Duration::days(7))
    }

    async fn collect_queue(&mut self, now: DateTime<Utc>) {
        for event in self.queue.try_recv_all().await {
            self.ingest(event, now);
        }
    }

    async fn run_cycle(&mut self, trigger: CycleTrigger, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::new(self.scope.clone(), trigger, now);
        info!("Starting evolution cycle {} ({:?})", report.id, report.trigger);

        self.enter(CyclePhase::Collecting);
        self.collect_queue(now).await;
        let pending = Pending {
            batch: self.buffer.drain(),
            retries: std::mem::take(&mut self.retries),
            forced: std::mem::take(&mut self.forced),
        };
        report.feedback_count = pending.batch.len();
        let plan = self.dispatch(&pending, &mut report);

        if self.shutdown.is_cancelled() {
            return self.abort(report, pending, now);
        }
        self.enter(CyclePhase::Evaluating);
        let evaluated = self.evaluate(&plan, &mut report, now).await;

        if self.shutdown.is_cancelled() {
            return self.abort(report, pending, now);
        }
        self.enter(CyclePhase::Resolving);
        let mut candidates = evaluated.proposals.clone();
        candidates.extend(self.submitted.iter().cloned());
        let resolution = resolver::resolve(candidates, self.agents.ranking());
        for proposal in &resolution.accepted {
            report.proposals.push(Self::record(proposal, ProposalOutcome::NoChange));
        }
        for superseded in &resolution.superseded {
            report.proposals.push(Self::record(
                &superseded.proposal,
                ProposalOutcome::Superseded { by: superseded.by },
            ));
        }

        if self.shutdown.is_cancelled() {
            report.proposals.clear();
            return self.abort(report, pending, now);
        }
        self.enter(CyclePhase::Committing);
        self.submitted.clear();

        let (agent_accepted, upstream_accepted): (Vec<&ProposedChange>, Vec<&ProposedChange>) =
            resolution
                .accepted
                .iter()
                .partition(|p| matches!(p.target, EntityKey::Agent(_)));

        let mut patterns_written = false;
        let mut committed: Vec<ProposedChange> = Vec::new();
        for proposal in upstream_accepted {
            let outcome = self.commit_proposal(proposal, &plan, &[], now).await;
            report.set_outcome(proposal.id, outcome.clone());
            if evaluated.behavior_proposal == Some(proposal.id) {
                patterns_written = matches!(
                    outcome,
                    ProposalOutcome::Applied { .. } | ProposalOutcome::RetryScheduled { .. }
                );
            }
            if outcome.is_applied() {
                committed.push(proposal.clone());
            }
        }

        // Agents follow only the memory and behavior proposals that were committed
        for input in &evaluated.agents {
            let key = EntityKey::Agent(input.current.value.id);
            let superseded = input
                .proposal
                .is_some_and(|id| resolution.superseded.iter().any(|s| s.proposal.id == id));
            let external = agent_accepted
                .iter()
                .any(|p| p.target == key && Some(p.id) != input.proposal);
            if superseded || external {
                continue;
            }

            let (evaluation, carried) = self.settle(input, &evaluated.upstream, &committed, now);
            match evaluation {
                AgentEvaluation::Proposed(proposed) => {
                    let evaluated_proposal = input
                        .proposal
                        .and_then(|id| agent_accepted.iter().find(|p| p.id == id));
                    let proposal = match evaluated_proposal {
                        Some(original) => {
                            let mut rebuilt = (*original).clone();
                            rebuilt.payload = ChangePayload::Agent(proposed.clone());
                            rebuilt
                        }
                        None => {
                            let proposal = self.agent_proposal(input, proposed.clone(), now);
                            report
                                .proposals
                                .push(Self::record(&proposal, ProposalOutcome::NoChange));
                            proposal
                        }
                    };
                    let outcome = self.commit_proposal(&proposal, &plan, &carried, now).await;
                    report.set_outcome(proposal.id, outcome.clone());
                    if !outcome.is_applied() {
                        let mut lineage = proposed.lineage;
                        lineage.outcome = outcome;
                        self.append_lineage(&lineage, now).await;
                    }
                }
                AgentEvaluation::NoChange(lineage) => {
                    if let Some(id) = input.proposal {
                        debug!("Agent '{}' no longer changes after settling", lineage.agent_name);
                        report.set_outcome(id, ProposalOutcome::NoChange);
                    }
                    if !lineage.entries.is_empty() {
                        self.append_lineage(&lineage, now).await;
                    }
                }
            }
        }

        let settled: HashSet<ProposalId> =
            evaluated.agents.iter().filter_map(|i| i.proposal).collect();
        for proposal in agent_accepted.iter().filter(|p| !settled.contains(&p.id)) {
            let outcome = self.commit_proposal(proposal, &plan, &[], now).await;
            report.set_outcome(proposal.id, outcome.clone());
            if let ChangePayload::Agent(proposed) = &proposal.payload {
                if !outcome.is_applied() {
                    let mut lineage = proposed.lineage.clone();
                    lineage.outcome = outcome;
                    self.append_lineage(&lineage, now).await;
                }
            }
        }
        for superseded in &resolution.superseded {
            if let ChangePayload::Agent(proposed) = &superseded.proposal.payload {
                let mut lineage = proposed.lineage.clone();
                lineage.outcome = ProposalOutcome::Superseded { by: superseded.by };
                self.append_lineage(&lineage, now).await;
            }
        }
        if !patterns_written {
            for pattern in &evaluated.patterns {
                if let Err(e) = self.store.upsert_pattern(pattern).await {
                    error!("Failed to store pattern {}: {}", pattern.key, e);
                }
            }
        }

        if let Some(summary) = self.assess_health(&mut report, now).await {
            report.health = Some(summary);
        }
        Self::finalize_statuses(&mut report);

        self.enter(CyclePhase::Idle);
        report.finished_at = Some(Utc::now().max(now));
        info!(
            "Evolution cycle {} finished: {} feedback, {} applied, {} proposals",
            report.id,
            report.feedback_count,
            report.applied().count(),
            report.proposals.len()
        );
        self.push_history(report.clone());
        report
    }

    /// Route valid feedback, forced subsystems and retries to subsystems
    fn dispatch(&self, pending: &Pending, report: &mut CycleReport) -> Plan {
        let mut plan = Plan::new();

        for item in &pending.batch {
            if let Err(e) = item.event.validate() {
                warn!("Dropping feedback: {}", e);
                report.malformed += 1;
                continue;
            }
            for subsystem in EvolutionSubsystem::ALL {
                if item.event.routes_to(subsystem) {
                    let dispatch = plan
                        .entry(subsystem)
                        .or_insert_with(|| Dispatch::new(item.priority));
                    dispatch.raise(item.priority);
                    dispatch.add_feedback(&item.event);
                }
            }
        }

        for (subsystem, priority) in &pending.forced {
            plan.entry(*subsystem)
                .or_insert_with(|| Dispatch::new(*priority))
                .raise(*priority);
        }

        for ticket in &pending.retries {
            let dispatch = plan
                .entry(ticket.subsystem)
                .or_insert_with(|| Dispatch::new(ticket.priority));
            dispatch.raise(ticket.priority);
            for event in &ticket.feedback {
                dispatch.add_feedback(event);
            }
            dispatch.retries.push(ticket.clone());
        }

        report.dispatched = plan.keys().copied().collect();
        plan
    }

    async fn evaluate(&self, plan: &Plan, report: &mut CycleReport, now: DateTime<Utc>) -> Evaluated {
        let since = self.window_start(now);
        let memory_dispatch = plan.get(&EvolutionSubsystem::Memory);
        let behavior_dispatch = plan.get(&EvolutionSubsystem::Behavior);

        let memory = async {
            match memory_dispatch {
                Some(d) => Some(self.evaluate_memory(d, since, now).await),
                None => None,
            }
        };
        let behavior = async {
            match behavior_dispatch {
                Some(d) => Some(self.evaluate_behavior(d, since, now).await),
                None => None,
            }
        };
        let (memory, behavior) = tokio::join!(memory, behavior);

        let mut evaluated = Evaluated::default();
        let mut upstream: Vec<Recommendation> = Vec::new();

        if let (Some(dispatch), Some(result)) = (memory_dispatch, memory) {
            let outcome = match result {
                Ok(Some(proposal)) => {
                    upstream.extend(Self::upstream_recommendations(&proposal));
                    evaluated.upstream.insert(proposal.id);
                    evaluated.proposals.push(proposal);
                    ProposalOutcome::NoChange
                }
                Ok(None) => ProposalOutcome::NoChange,
                Err(e) => Self::isolate(EvolutionSubsystem::Memory, e),
            };
            report.record(EvolutionSubsystem::Memory, dispatch.priority, outcome);
        }

        if let (Some(dispatch), Some(result)) = (behavior_dispatch, behavior) {
            let outcome = match result {
                Ok((proposal, evaluation)) => {
                    report.malformed += evaluation.skipped;
                    evaluated.patterns = evaluation.patterns;
                    if let Some(proposal) = proposal {
                        upstream.extend(Self::upstream_recommendations(&proposal));
                        evaluated.upstream.insert(proposal.id);
                        evaluated.behavior_proposal = Some(proposal.id);
                        evaluated.proposals.push(proposal);
                    }
                    ProposalOutcome::NoChange
                }
                Err(e) => Self::isolate(EvolutionSubsystem::Behavior, e),
            };
            report.record(EvolutionSubsystem::Behavior, dispatch.priority, outcome);
        }

        let submitted: Vec<Recommendation> = self
            .submitted
            .iter()
            .flat_map(Self::upstream_recommendations)
            .collect();
        let agents_dispatch = plan.get(&EvolutionSubsystem::Agents);
        if agents_dispatch.is_some() || !upstream.is_empty() || !submitted.is_empty() {
            let priority = agents_dispatch
                .map(|d| d.priority)
                .or_else(|| upstream.iter().chain(&submitted).map(|r| r.priority).max())
                .unwrap_or_default();
            let outcome = match self
                .evaluate_agents(agents_dispatch, priority, &upstream, &evaluated.patterns, since, now)
                .await
            {
                Ok(agents) => {
                    evaluated.proposals.extend(agents.proposals);
                    evaluated.agents = agents.inputs;
                    ProposalOutcome::NoChange
                }
                Err(e) => Self::isolate(EvolutionSubsystem::Agents, e),
            };
            report.record(EvolutionSubsystem::Agents, priority, outcome);
        }

        evaluated
    }

    /// Agent recommendations implied by a memory or behavior proposal
    fn upstream_recommendations(proposal: &ProposedChange) -> Vec<Recommendation> {
        match &proposal.payload {
            ChangePayload::Memory(params) => params.recommendations(proposal.priority, proposal),
            ChangePayload::Behavior(update) => update.recommendations(proposal.priority, proposal),
            ChangePayload::Agent(_) => Vec::new(),
        }
    }

    /// Turn a subsystem failure into an outcome without touching the others
    fn isolate(subsystem: EvolutionSubsystem, e: EvolutionError) -> ProposalOutcome {
        if e.is_skippable() {
            info!("Skipping {} this cycle: {}", subsystem, e);
            ProposalOutcome::Skipped {
                reason: e.to_string(),
            }
        } else {
            error!("{} evaluation failed: {}", subsystem, e);
            ProposalOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }

    async fn evaluate_memory(
        &self,
        dispatch: &Dispatch,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProposedChange>> {
        let limit = self.config.cycle.window_limit;
        let (version, current) = self.store.current_memory_params(&self.scope).await?;
        let facts = self.store.read_facts(&self.scope, since, limit).await?;
        let operations = self.store.read_operations(&self.scope, since, limit).await?;

        let Some(proposed) = self.memory.evaluate(&facts, &operations, &current, now)? else {
            debug!("Memory evolution: no change for {}", self.scope);
            return Ok(None);
        };

        let mut triggers = MemoryEvolution::evidence(&operations);
        triggers.merge(&dispatch.feedback_ids());
        Ok(Some(
            ProposedChange::new(
                EvolutionSubsystem::Memory,
                dispatch.priority,
                self.scope.clone(),
                EntityKey::MemoryParams,
                version,
                ChangePayload::Memory(proposed),
                now,
            )
            .with_triggers(triggers)
            .with_retry_of(dispatch.retry_of(&EntityKey::MemoryParams)),
        ))
    }

    async fn evaluate_behavior(
        &self,
        dispatch: &Dispatch,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Option<ProposedChange>, BehaviorEvaluation)> {
        let limit = self.config.cycle.window_limit;
        let (version, current) = self.store.current_behavior(&self.scope).await?;
        let logs = self.store.read_agent_logs(&self.scope, since, limit).await?;
        let known = self.store.read_patterns(&self.scope, since, limit).await?;

        let evaluation =
            self.behavior
                .evaluate(&self.scope, &logs, &dispatch.feedback, &known, &current)?;

        let proposal = BehaviorUpdate::from_changes(
            &current,
            evaluation.proposals.clone(),
            evaluation.patterns.clone(),
        )
        .map(|update| {
            let mut triggers = update.evidence();
            triggers.merge(&dispatch.feedback_ids());
            ProposedChange::new(
                EvolutionSubsystem::Behavior,
                dispatch.priority,
                self.scope.clone(),
                EntityKey::BehaviorProfile,
                version,
                ChangePayload::Behavior(update),
                now,
            )
            .with_triggers(triggers)
            .with_retry_of(dispatch.retry_of(&EntityKey::BehaviorProfile))
        });
        Ok((proposal, evaluation))
    }

    async fn evaluate_agents(
        &self,
        dispatch: Option<&Dispatch>,
        priority: EvolutionPriority,
        upstream: &[Recommendation],
        fresh_patterns: &[Pattern],
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AgentsEvaluated> {
        let limit = self.config.cycle.window_limit;
        let agents = self.store.list_agents(&self.scope).await?;
        let (logs, patterns) = match dispatch {
            Some(_) => {
                let logs = self.store.read_agent_logs(&self.scope, since, limit).await?;
                let mut patterns = self.store.read_patterns(&self.scope, since, limit).await?;
                // Patterns detected this cycle replace their stored versions
                patterns.retain(|p| !fresh_patterns.iter().any(|f| f.key == p.key));
                patterns.extend(fresh_patterns.iter().cloned());
                (logs, patterns)
            }
            None => (Vec::new(), Vec::new()),
        };

        let mut result = AgentsEvaluated::default();
        for current in agents {
            if current.value.status == AgentStatus::Disabled {
                debug!("Agent '{}' is disabled, not evolving", current.value.name);
                continue;
            }
            let ticket = dispatch.and_then(|d| d.retry_for(&EntityKey::Agent(current.value.id)));

            let mut carried = upstream.to_vec();
            for rec in ticket.map(|t| t.recommendations.as_slice()).unwrap_or_default() {
                if !carried.iter().any(|c| c.id == rec.id) {
                    carried.push(rec.clone());
                }
            }
            let (own, triggers) = match dispatch {
                Some(d) => {
                    let agent = &current.value;
                    let (mut own, mut triggers) =
                        self.agents.performance_recommendations(agent, &logs, priority, now);
                    let (from_patterns, evidence) =
                        self.agents.pattern_recommendations(agent, &patterns, priority, now);
                    own.extend(from_patterns);
                    triggers.merge(&evidence);
                    triggers.merge(&d.feedback_ids());
                    (own, triggers)
                }
                None => (Vec::new(), Evidence::default()),
            };

            let mut input = AgentInputs {
                retry_of: ticket.map(|t| t.proposal_id),
                current,
                priority,
                carried,
                own,
                triggers,
                proposal: None,
            };
            match self.merge(&input, &input.carried, now) {
                AgentEvaluation::Proposed(proposed) => {
                    let proposal = self.agent_proposal(&input, proposed, now);
                    input.proposal = Some(proposal.id);
                    result.proposals.push(proposal);
                }
                AgentEvaluation::NoChange(_) => {
                    debug!("Agent '{}': no change", input.current.value.name);
                }
            }
            result.inputs.push(input);
        }
        Ok(result)
    }

    fn merge(&self, input: &AgentInputs, carried: &[Recommendation], now: DateTime<Utc>) -> AgentEvaluation {
        let (from_memory, from_behavior): (Vec<_>, Vec<_>) = carried
            .iter()
            .cloned()
            .partition(|r| r.origin == EvolutionSubsystem::Memory);
        self.agents
            .evaluate(&input.current, &from_memory, &from_behavior, &input.own, now)
    }

    fn agent_proposal(
        &self,
        input: &AgentInputs,
        proposed: ProposedAgentVersion,
        now: DateTime<Utc>,
    ) -> ProposedChange {
        ProposedChange::new(
            EvolutionSubsystem::Agents,
            input.priority,
            self.scope.clone(),
            EntityKey::Agent(input.current.value.id),
            Some(input.current.version),
            ChangePayload::Agent(proposed),
            now,
        )
        .with_triggers(input.triggers.clone())
        .with_retry_of(input.retry_of)
    }

    /// Re-merge an agent against the upstream proposals that were committed.
    /// Recommendations from uncommitted proposals are rejected, and committed
    /// proposals the agent was not evaluated against are added.
    fn settle(
        &self,
        input: &AgentInputs,
        upstream: &HashSet<ProposalId>,
        committed: &[ProposedChange],
        now: DateTime<Utc>,
    ) -> (AgentEvaluation, Vec<Recommendation>) {
        let applied: HashSet<ProposalId> = committed.iter().map(|p| p.id).collect();
        let (mut carried, dropped): (Vec<_>, Vec<_>) =
            input.carried.iter().cloned().partition(|r| match r.proposal_id {
                Some(id) => !upstream.contains(&id) || applied.contains(&id),
                None => true,
            });
        for proposal in committed.iter().filter(|p| !upstream.contains(&p.id)) {
            carried.extend(Self::upstream_recommendations(proposal));
        }

        let mut evaluation = self.merge(input, &carried, now);
        for rec in dropped {
            let reason = match rec.proposal_id {
                Some(id) => format!("{} proposal {} was not applied", rec.origin, id),
                None => format!("{} proposal was not applied", rec.origin),
            };
            evaluation.lineage_mut().reject(rec, reason);
        }
        (evaluation, carried)
    }

    fn commit_for(proposal: &ProposedChange, now: DateTime<Utc>) -> Commit {
        match &proposal.payload {
            ChangePayload::Memory(params) => MemoryEvolution::commit_for(proposal, params, now),
            ChangePayload::Behavior(update) => BehaviorEvolution::commit_for(proposal, update, now),
            ChangePayload::Agent(version) => AgentEvolution::commit_for(proposal, version, now),
        }
    }

    async fn commit_proposal(
        &mut self,
        proposal: &ProposedChange,
        plan: &Plan,
        carried: &[Recommendation],
        now: DateTime<Utc>,
    ) -> ProposalOutcome {
        let commit = Self::commit_for(proposal, now);
        let next = commit.next_version();

        match self.store.commit(commit).await {
            Ok(ack) => {
                let version = match ack {
                    Ack::Committed { version, .. } => version,
                    Ack::Appended { .. } => next,
                };
                info!(
                    "Committed {} v{} ({} {}, proposal {})",
                    proposal.target, version, proposal.subsystem, proposal.priority, proposal.id
                );
                ProposalOutcome::Applied { version }
            }
            Err(e) if e.is_retryable() => self.schedule_retry(proposal, plan, carried, &e),
            Err(e) => {
                error!("Commit of {} failed: {}", proposal.target, e);
                ProposalOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn schedule_retry(
        &mut self,
        proposal: &ProposedChange,
        plan: &Plan,
        carried: &[Recommendation],
        cause: &EvolutionError,
    ) -> ProposalOutcome {
        let dispatch = plan.get(&proposal.subsystem);
        let attempt = dispatch
            .and_then(|d| d.retry_for(&proposal.target))
            .map_or(0, |t| t.attempt)
            + 1;

        if attempt > self.config.cycle.max_retry_attempts {
            warn!(
                "Giving up on {} after {} attempts: {}",
                proposal.target,
                attempt - 1,
                cause
            );
            return ProposalOutcome::Failed {
                reason: cause.to_string(),
            };
        }

        warn!(
            "Commit of {} deferred ({}), retry {} next cycle",
            proposal.target, cause, attempt
        );
        let recommendations = match proposal.target {
            EntityKey::Agent(_) => carried.to_vec(),
            _ => Vec::new(),
        };
        self.retries.push(RetryTicket {
            subsystem: proposal.subsystem,
            target: proposal.target,
            priority: proposal.priority,
            attempt,
            proposal_id: proposal.id,
            feedback: dispatch.map(|d| d.feedback.clone()).unwrap_or_default(),
            recommendations,
        });
        ProposalOutcome::RetryScheduled { attempt }
    }

    async fn append_lineage(&self, lineage: &Lineage, now: DateTime<Utc>) {
        let log = AgentEvolution::lineage_log(&self.scope, lineage, now);
        if let Err(e) = self.store.append_agent_log(&log).await {
            error!("Failed to record lineage of agent '{}': {}", lineage.agent_name, e);
        }
    }

    /// Assess health and roll back this cycle's commits for failing subsystems
    async fn assess_health(&self, report: &mut CycleReport, now: DateTime<Utc>) -> Option<HealthSummary> {
        let summary = match health::assess(self.store.as_ref(), &self.scope, &self.config.health, now).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Health assessment failed: {}", e);
                return None;
            }
        };
        if summary.healthy || !self.config.health.auto_rollback {
            return Some(summary);
        }

        for subsystem in summary.failing_subsystems() {
            let applied: Vec<(ProposalId, EntityKey)> = report
                .proposals
                .iter()
                .filter(|p| p.subsystem == subsystem && p.outcome.is_applied())
                .map(|p| (p.id, p.target))
                .collect();
            for (id, target) in applied {
                let reason = format!("health {:.0}% after cycle {}", summary.score * 100.0, report.id);
                match self.rollback_at(&target, &reason, now).await {
                    Ok(version) => report.set_outcome(id, ProposalOutcome::RolledBack { version }),
                    Err(e) => error!("Rollback of {} failed: {}", target, e),
                }
            }
        }
        Some(summary)
    }

    fn record(proposal: &ProposedChange, outcome: ProposalOutcome) -> ProposalRecord {
        ProposalRecord {
            id: proposal.id,
            subsystem: proposal.subsystem,
            target: proposal.target,
            priority: proposal.priority,
            retry_of: proposal.retry_of,
            outcome,
        }
    }

    /// Subsystem status reflects its proposals once they are decided
    fn finalize_statuses(report: &mut CycleReport) {
        let proposals = report.proposals.clone();
        for status in report.subsystems.iter_mut() {
            let mut own = proposals.iter().filter(|p| p.subsystem == status.subsystem);
            let first = own.clone().next();
            if let Some(record) = own.find(|p| p.outcome.is_applied()).or(first) {
                status.outcome = record.outcome.clone();
            }
        }
    }

    fn abort(&mut self, mut report: CycleReport, pending: Pending, now: DateTime<Utc>) -> CycleReport {
        warn!("Evolution cycle {} cancelled during {}", report.id, self.phase);
        report.aborted = Some(self.phase);
        report.finished_at = Some(now);

        self.buffer.requeue_front(pending.batch);
        self.retries.extend(pending.retries);
        for (subsystem, priority) in pending.forced {
            let entry = self.forced.entry(subsystem).or_insert(priority);
            *entry = (*entry).max(priority);
        }

        self.enter(CyclePhase::Idle);
        self.push_history(report.clone());
        report
    }

    fn push_history(&mut self, report: CycleReport) {
        self.history.push_back(report);
        while self.history.len() > self.config.cycle.max_history {
            self.history.pop_front();
        }
    }
}
