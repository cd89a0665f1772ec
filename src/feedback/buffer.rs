//! Bounded feedback buffer with an inspectable flush trigger

use super::FeedbackEvent;
use crate::evolution::config::BufferConfig;
use crate::evolution::proposal::EvolutionPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Classified event waiting for the next cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedFeedback {
    pub event: FeedbackEvent,
    pub priority: EvolutionPriority,
    pub received_at: DateTime<Utc>,
}

/// Why the buffer wants to be flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// A critical item is waiting
    Critical,
    /// `max_items` reached
    Count,
    /// The oldest item exceeded `max_age`
    Age,
}

pub struct FeedbackBuffer {
    items: VecDeque<BufferedFeedback>,
    config: BufferConfig,
    evicted: usize,
}

impl FeedbackBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total items dropped because the buffer was full
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Add an item, evicting the oldest one if capacity is exceeded
    pub fn push(&mut self, item: BufferedFeedback) -> Option<BufferedFeedback> {
        self.items.push_back(item);
        if self.items.len() > self.config.capacity {
            let dropped = self.items.pop_front();
            if let Some(dropped) = &dropped {
                self.evicted += 1;
                warn!(
                    "Feedback buffer full ({} items), evicting {}",
                    self.config.capacity, dropped.event.id
                );
            }
            return dropped;
        }
        None
    }

    /// Decide whether the buffered window should be flushed now
    pub fn flush_trigger(&self, now: DateTime<Utc>) -> Option<FlushTrigger> {
        if self
            .items
            .iter()
            .any(|i| i.priority == EvolutionPriority::Critical)
        {
            return Some(FlushTrigger::Critical);
        }
        if self.items.len() >= self.config.max_items {
            return Some(FlushTrigger::Count);
        }
        let oldest = self.items.iter().map(|i| i.received_at).min()?;
        let age = now.signed_duration_since(oldest).to_std().unwrap_or_default();
        if age >= self.config.max_age {
            return Some(FlushTrigger::Age);
        }
        None
    }

    /// Take the whole buffered window
    pub fn drain(&mut self) -> Vec<BufferedFeedback> {
        self.items.drain(..).collect()
    }

    /// Put a drained batch back in front of anything that arrived since
    pub fn requeue_front(&mut self, batch: Vec<BufferedFeedback>) {
        for item in batch.into_iter().rev() {
            self.items.push_front(item);
        }
        while self.items.len() > self.config.capacity {
            if self.items.pop_back().is_some() {
                self.evicted += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedFeedback> {
        self.items.iter()
    }
}
