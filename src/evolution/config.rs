// Evolution Configuration
//
// Defines configuration for the evolution cycle: polling, feedback
// buffering, per-subsystem significance thresholds, priority defaults
// and post-commit health checks.

use crate::evolution::proposal::{EvolutionPriority, SubsystemRanking};
use crate::feedback::FeedbackSource;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main evolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Enable/disable all evolution cycles
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub cycle: CycleConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub memory: MemoryEvolutionConfig,

    #[serde(default)]
    pub behavior: BehaviorEvolutionConfig,

    #[serde(default)]
    pub agents: AgentEvolutionConfig,

    #[serde(default)]
    pub priorities: PriorityConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

fn default_true() -> bool {
    true
}

/// Cycle scheduling and evaluation windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Interval between flush-trigger checks (in seconds)
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,

    /// How far back evaluation windows reach (in seconds)
    #[serde(with = "serde_duration")]
    pub window: Duration,

    /// Maximum records read per window
    pub window_limit: usize,

    /// Cycle reports kept in memory
    pub max_history: usize,

    /// Attempts before a conflicting change is abandoned
    pub max_retry_attempts: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            window: Duration::from_secs(604800), // 7 days
            window_limit: 500,
            max_history: 100,
            max_retry_attempts: 3,
        }
    }
}

/// Feedback buffer flush triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Flush once this many items are buffered
    pub max_items: usize,

    /// Flush once the oldest item is this old (in seconds)
    #[serde(with = "serde_duration")]
    pub max_age: Duration,

    /// Hard bound; oldest items are evicted beyond it
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_age: Duration::from_secs(21600), // 6 hours
            capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryEvolutionConfig {
    /// Minimum statistical delta before a new MemoryParams is proposed
    pub significance_threshold: f32,
    pub min_operations: usize,
    pub min_facts: usize,
    /// Decay-candidate ratio considered healthy
    pub target_decay_ratio: f32,
    /// Operations below this confidence count as low-confidence
    pub low_confidence_cutoff: f32,
}

impl Default for MemoryEvolutionConfig {
    fn default() -> Self {
        Self {
            significance_threshold: 0.15,
            min_operations: 10,
            min_facts: 5,
            target_decay_ratio: 0.3,
            low_confidence_cutoff: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorEvolutionConfig {
    /// Minimum pattern support before an adjustment is proposed
    pub min_support: u32,
    pub min_confidence: f32,
    /// Pseudo-count in confidence = support / (support + prior)
    pub confidence_prior: f32,
    /// Largest single-step change allowed on a 0..1 parameter
    pub max_adjustment: f32,
}

impl Default for BehaviorEvolutionConfig {
    fn default() -> Self {
        Self {
            min_support: 2,
            min_confidence: 0.3,
            confidence_prior: 3.0,
            max_adjustment: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEvolutionConfig {
    pub min_runs_for_analysis: u32,
    pub success_rate_min: f32,
    /// Support a per-agent recurring failure pattern needs before it tunes the agent
    pub failure_pattern_support: u32,
    /// Tie-break between subsystems of equal priority
    pub subsystem_ranking: SubsystemRanking,
}

impl Default for AgentEvolutionConfig {
    fn default() -> Self {
        Self {
            min_runs_for_analysis: 10,
            success_rate_min: 0.7,
            failure_pattern_support: 3,
            subsystem_ranking: SubsystemRanking::default(),
        }
    }
}

/// Default priority assigned to feedback by source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub user_explicit: EvolutionPriority,
    pub implicit_behavioral: EvolutionPriority,
    pub system_health: EvolutionPriority,
    pub scheduled_periodic: EvolutionPriority,
}

impl PriorityConfig {
    pub fn for_source(&self, source: FeedbackSource) -> EvolutionPriority {
        match source {
            FeedbackSource::UserExplicit => self.user_explicit,
            FeedbackSource::ImplicitBehavioral => self.implicit_behavioral,
            FeedbackSource::SystemHealth => self.system_health,
            FeedbackSource::ScheduledPeriodic => self.scheduled_periodic,
        }
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            user_explicit: EvolutionPriority::High,
            implicit_behavioral: EvolutionPriority::Normal,
            system_health: EvolutionPriority::Critical,
            scheduled_periodic: EvolutionPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Minimum health score after a cycle's commits
    pub threshold: f32,
    pub min_agent_success_rate: f32,
    /// Roll back this cycle's commits when the score drops below threshold
    pub auto_rollback: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            min_agent_success_rate: 0.7,
            auto_rollback: true,
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle: CycleConfig::default(),
            buffer: BufferConfig::default(),
            memory: MemoryEvolutionConfig::default(),
            behavior: BehaviorEvolutionConfig::default(),
            agents: AgentEvolutionConfig::default(),
            priorities: PriorityConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl EvolutionConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EvolutionConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.poll_interval < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(
                "cycle: poll_interval must be at least 1 second".to_string(),
            ));
        }
        if self.cycle.window_limit == 0 || self.cycle.max_history == 0 {
            return Err(ConfigError::ValidationError(
                "cycle: window_limit and max_history must be at least 1".to_string(),
            ));
        }

        if self.buffer.max_items == 0 {
            return Err(ConfigError::ValidationError(
                "buffer: max_items must be at least 1".to_string(),
            ));
        }
        if self.buffer.capacity < self.buffer.max_items {
            return Err(ConfigError::ValidationError(format!(
                "buffer: capacity ({}) must be at least max_items ({})",
                self.buffer.capacity, self.buffer.max_items
            )));
        }

        Self::validate_unit("memory.significance_threshold", self.memory.significance_threshold)?;
        Self::validate_unit("memory.target_decay_ratio", self.memory.target_decay_ratio)?;
        Self::validate_unit("memory.low_confidence_cutoff", self.memory.low_confidence_cutoff)?;
        if self.memory.min_operations == 0 || self.memory.min_facts == 0 {
            return Err(ConfigError::ValidationError(
                "memory: min_operations and min_facts must be at least 1".to_string(),
            ));
        }

        Self::validate_unit("behavior.min_confidence", self.behavior.min_confidence)?;
        Self::validate_unit("behavior.max_adjustment", self.behavior.max_adjustment)?;
        if self.behavior.min_support == 0 {
            return Err(ConfigError::ValidationError(
                "behavior: min_support must be at least 1".to_string(),
            ));
        }
        if self.behavior.confidence_prior <= 0.0 {
            return Err(ConfigError::ValidationError(
                "behavior: confidence_prior must be positive".to_string(),
            ));
        }

        Self::validate_unit("agents.success_rate_min", self.agents.success_rate_min)?;
        if self.agents.min_runs_for_analysis == 0 {
            return Err(ConfigError::ValidationError(
                "agents: min_runs_for_analysis must be at least 1".to_string(),
            ));
        }
        if self.agents.failure_pattern_support == 0 {
            return Err(ConfigError::ValidationError(
                "agents: failure_pattern_support must be at least 1".to_string(),
            ));
        }
        if !self.agents.subsystem_ranking.is_complete() {
            return Err(ConfigError::ValidationError(
                "agents: subsystem_ranking must list memory, behavior and agents exactly once"
                    .to_string(),
            ));
        }

        Self::validate_unit("health.threshold", self.health.threshold)?;
        Self::validate_unit("health.min_agent_success_rate", self.health.min_agent_success_rate)?;

        Ok(())
    }

    fn validate_unit(name: &str, value: f32) -> Result<(), ConfigError> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "{} must be in (0, 1], got {}",
                name, value
            )));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::proposal::EvolutionSubsystem;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvolutionConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_poll_interval_too_short() {
        let mut config = EvolutionConfig::default();
        config.cycle.poll_interval = Duration::from_millis(200);

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("poll_interval must be at least 1 second"));
    }

    #[test]
    fn test_validate_capacity_below_max_items() {
        let mut config = EvolutionConfig::default();
        config.buffer.capacity = 10;

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("capacity (10)"));
    }

    #[test]
    fn test_validate_threshold_out_of_range() {
        let mut config = EvolutionConfig::default();
        config.memory.significance_threshold = 0.0;
        assert!(config.validate().is_err());

        config.memory.significance_threshold = 1.5;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("memory.significance_threshold"));
    }

    #[test]
    fn test_validate_ranking_duplicates() {
        let mut config = EvolutionConfig::default();
        config.agents.subsystem_ranking = SubsystemRanking(vec![
            EvolutionSubsystem::Memory,
            EvolutionSubsystem::Memory,
            EvolutionSubsystem::Agents,
        ]);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("subsystem_ranking"));
    }

    #[test]
    fn test_from_toml_partial() {
        let toml_str = r#"
            enabled = true

            [cycle]
            poll_interval = 5

            [agents]
            subsystem_ranking = ["behavior", "memory", "agents"]

            [priorities]
            scheduled_periodic = "medium"
        "#;

        let config = EvolutionConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.cycle.poll_interval, Duration::from_secs(5));
        assert_eq!(config.cycle.window_limit, 500);
        assert_eq!(config.buffer.max_items, 50);
        assert_eq!(
            config.agents.subsystem_ranking.rank(EvolutionSubsystem::Behavior),
            0
        );
        assert_eq!(
            config.priorities.for_source(FeedbackSource::ScheduledPeriodic),
            EvolutionPriority::Normal
        );
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = EvolutionConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EvolutionConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.enabled, deserialized.enabled);
        assert_eq!(config.buffer.max_age, deserialized.buffer.max_age);
        assert_eq!(
            config.priorities.system_health,
            deserialized.priorities.system_health
        );
    }

    #[test]
    fn test_to_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evolution.toml");
        EvolutionConfig::default().to_file(&path).unwrap();

        let loaded = EvolutionConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cycle.max_retry_attempts, 3);
    }
}
