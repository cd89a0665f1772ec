//! Feedback queue for producer-to-orchestrator communication
//!
//! Producers on other tasks hold a cloneable [`FeedbackSender`]; the
//! orchestrator drains the queue at the start of each collecting phase.

use super::FeedbackEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unbounded feedback queue
#[derive(Clone)]
pub struct FeedbackQueue {
    sender: mpsc::UnboundedSender<FeedbackEvent>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FeedbackEvent>>>,
}

impl FeedbackQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    pub fn send(&self, event: FeedbackEvent) -> Result<(), SendError> {
        self.sender
            .send(event)
            .map_err(|_| SendError::ReceiverDropped)
    }

    /// Drain every pending event without blocking
    pub async fn try_recv_all(&self) -> Vec<FeedbackEvent> {
        let mut events = Vec::new();
        let mut receiver = self.receiver.lock().await;

        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }

        events
    }

    pub async fn has_pending(&self) -> bool {
        let receiver = self.receiver.lock().await;
        !receiver.is_empty()
    }

    /// Get a sender handle for producers
    pub fn get_sender(&self) -> FeedbackSender {
        FeedbackSender {
            sender: self.sender.clone(),
        }
    }
}

impl Default for FeedbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Lightweight, cloneable producer handle
#[derive(Clone)]
pub struct FeedbackSender {
    sender: mpsc::UnboundedSender<FeedbackEvent>,
}

impl FeedbackSender {
    pub fn send(&self, event: FeedbackEvent) -> Result<(), SendError> {
        self.sender
            .send(event)
            .map_err(|_| SendError::ReceiverDropped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The orchestrator has been dropped
    ReceiverDropped,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::ReceiverDropped => write!(f, "Receiver dropped"),
        }
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{FeedbackPayload, FeedbackSource};
    use chrono::Utc;

    fn tick() -> FeedbackEvent {
        FeedbackEvent::new(FeedbackSource::ScheduledPeriodic, FeedbackPayload::Tick, Utc::now())
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let queue = FeedbackQueue::new();
        let first = tick();
        let second = tick();
        queue.send(first.clone()).unwrap();
        queue.send(second.clone()).unwrap();

        assert!(queue.has_pending().await);
        let events = queue.try_recv_all().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, first.id);
        assert_eq!(events[1].id, second.id);
        assert!(!queue.has_pending().await);
    }

    #[tokio::test]
    async fn test_sender_from_another_task() {
        let queue = FeedbackQueue::new();
        let sender = queue.get_sender();

        tokio::spawn(async move {
            sender.send(tick()).unwrap();
        })
        .await
        .unwrap();

        assert_eq!(queue.try_recv_all().await.len(), 1);
    }
}
