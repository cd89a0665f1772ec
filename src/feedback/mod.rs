//! Feedback ingestion
//!
//! Upstream producers (chat routes, agent runners, health probes, the
//! scheduler) submit [`FeedbackEvent`]s. The orchestrator classifies each
//! event by [`EvolutionPriority`], buffers it in a [`FeedbackBuffer`] and
//! routes it to the subsystems its [`FeedbackSource`] may trigger.

pub mod buffer;
pub mod queue;
pub mod signals;

pub use buffer::{BufferedFeedback, FeedbackBuffer, FlushTrigger};
pub use queue::{FeedbackQueue, FeedbackSender, SendError};
pub use signals::TextSignal;

use crate::error::{EvolutionError, Result};
use crate::evolution::config::PriorityConfig;
use crate::evolution::proposal::{EvolutionPriority, EvolutionSubsystem};
use crate::types::{AgentId, FeedbackId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a feedback signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// Direct user statement: ratings, corrections, "be shorter"
    UserExplicit,
    /// Inferred from usage: chat tone, re-asked questions
    ImplicitBehavioral,
    /// Agent failures and system probes
    SystemHealth,
    /// Periodic scheduler tick
    ScheduledPeriodic,
}

impl FeedbackSource {
    /// Subsystems this source may trigger
    pub fn routes(&self) -> &'static [EvolutionSubsystem] {
        use EvolutionSubsystem::*;
        match self {
            FeedbackSource::UserExplicit => &[Behavior, Agents],
            FeedbackSource::ImplicitBehavioral => &[Behavior, Memory],
            FeedbackSource::SystemHealth => &[Memory, Agents],
            FeedbackSource::ScheduledPeriodic => &[Memory, Behavior, Agents],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackSource::UserExplicit => "user_explicit",
            FeedbackSource::ImplicitBehavioral => "implicit_behavioral",
            FeedbackSource::SystemHealth => "system_health",
            FeedbackSource::ScheduledPeriodic => "scheduled_periodic",
        }
    }
}

impl std::fmt::Display for FeedbackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feedback content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FeedbackPayload {
    Message {
        text: String,
    },
    Rating {
        positive: bool,
        #[serde(default)]
        comment: Option<String>,
    },
    AgentOutcome {
        agent_id: AgentId,
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    HealthMetric {
        name: String,
        value: f64,
    },
    Tick,
}

/// A `(source, payload, timestamp)` tuple from upstream
///
/// Source and timestamp are optional on the wire so that malformed entries
/// can be represented, counted and dropped instead of failing a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    #[serde(default)]
    pub id: FeedbackId,
    #[serde(default)]
    pub source: Option<FeedbackSource>,
    pub payload: FeedbackPayload,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Explicit priority; overrides the per-source default
    #[serde(default)]
    pub priority: Option<EvolutionPriority>,
}

impl FeedbackEvent {
    pub fn new(source: FeedbackSource, payload: FeedbackPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: FeedbackId::new(),
            source: Some(source),
            payload,
            timestamp: Some(timestamp),
            priority: None,
        }
    }

    /// Chat message feedback
    pub fn message(source: FeedbackSource, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(source, FeedbackPayload::Message { text: text.into() }, timestamp)
    }

    pub fn with_priority(mut self, priority: EvolutionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Check required fields, returning the source and timestamp
    pub fn validate(&self) -> Result<(FeedbackSource, DateTime<Utc>)> {
        let malformed = |reason: &str| EvolutionError::MalformedFeedback {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };

        let source = self.source.ok_or_else(|| malformed("missing source"))?;
        let timestamp = self.timestamp.ok_or_else(|| malformed("missing timestamp"))?;
        if let FeedbackPayload::Message { text } = &self.payload {
            if text.trim().is_empty() {
                return Err(malformed("empty message"));
            }
        }
        Ok((source, timestamp))
    }

    /// Priority assigned during classification
    pub fn classify(&self, priorities: &PriorityConfig) -> EvolutionPriority {
        match (self.priority, self.source) {
            (Some(priority), _) => priority,
            (None, Some(source)) => priorities.for_source(source),
            (None, None) => EvolutionPriority::Low,
        }
    }

    /// Whether this event may trigger the given subsystem
    pub fn routes_to(&self, subsystem: EvolutionSubsystem) -> bool {
        self.source
            .map(|s| s.routes().contains(&subsystem))
            .unwrap_or(false)
    }

    /// Free text carried by the payload, if any
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            FeedbackPayload::Message { text } => Some(text),
            FeedbackPayload::Rating { comment, .. } => comment.as_deref(),
            FeedbackPayload::AgentOutcome { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_table() {
        use EvolutionSubsystem::*;
        assert_eq!(FeedbackSource::UserExplicit.routes(), &[Behavior, Agents]);
        assert!(!FeedbackSource::SystemHealth.routes().contains(&Behavior));
        assert_eq!(FeedbackSource::ScheduledPeriodic.routes().len(), 3);
    }

    #[test]
    fn test_validate_missing_fields() {
        let now = Utc::now();
        let mut event = FeedbackEvent::message(FeedbackSource::UserExplicit, "shorter please", now);
        assert!(event.validate().is_ok());

        event.timestamp = None;
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("missing timestamp"));

        event.timestamp = Some(now);
        event.source = None;
        assert!(event.validate().unwrap_err().to_string().contains("missing source"));

        let empty = FeedbackEvent::message(FeedbackSource::UserExplicit, "  ", now);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_classify_uses_override_then_source() {
        let priorities = PriorityConfig::default();
        let now = Utc::now();
        let event = FeedbackEvent::new(FeedbackSource::SystemHealth, FeedbackPayload::Tick, now);
        assert_eq!(event.classify(&priorities), EvolutionPriority::Critical);

        let event = event.with_priority(EvolutionPriority::High);
        assert_eq!(event.classify(&priorities), EvolutionPriority::High);
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let json = r#"{"source":"user_explicit","payload":{"type":"message","text":"thanks"}}"#;
        let event: FeedbackEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.source, Some(FeedbackSource::UserExplicit));
        assert!(event.timestamp.is_none());
        assert!(event.validate().is_err());
    }
}
