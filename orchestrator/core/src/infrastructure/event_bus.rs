// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Orchestration Events
//
// In-memory fan-out over a tokio broadcast channel. Slow subscribers lag and
// lose events; publishers never block and never fail.

use crate::domain::events::OrchestrationEvent;
use crate::domain::run::RunId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<OrchestrationEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered per subscriber before the
    /// oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        debug!(run_id = %event.run_id(), "Publishing event: {:?}", event);

        // send() only errors when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single run.
    pub fn subscribe_run(&self, run_id: RunId) -> RunEventReceiver {
        RunEventReceiver {
            receiver: self.sender.subscribe(),
            run_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<OrchestrationEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<OrchestrationEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<OrchestrationEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

pub struct RunEventReceiver {
    receiver: broadcast::Receiver<OrchestrationEvent>,
    run_id: RunId,
}

impl RunEventReceiver {
    /// Next event for this run; events of other runs are skipped.
    pub async fn recv(&mut self) -> Result<OrchestrationEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.run_id() == &self.run_id {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::WorkflowId;
    use chrono::Utc;

    fn enqueued(run_id: &str) -> OrchestrationEvent {
        OrchestrationEvent::RunEnqueued {
            run_id: RunId::from(run_id),
            workflow_id: WorkflowId::from("wf"),
            step_count: 1,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(enqueued("run_a"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.run_id().as_str(), "run_a");
    }

    #[tokio::test]
    async fn test_run_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_run(RunId::from("run_b"));

        event_bus.publish(enqueued("run_a"));
        event_bus.publish(enqueued("run_b"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.run_id().as_str(), "run_b");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let event_bus = EventBus::default();
        event_bus.publish(enqueued("run_a"));
        assert_eq!(event_bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_dropped_events() {
        let event_bus = EventBus::new(1);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(enqueued("run_a"));
        event_bus.publish(enqueued("run_b"));

        assert!(matches!(receiver.try_recv(), Err(EventBusError::Lagged(1))));
        assert_eq!(receiver.try_recv().unwrap().run_id().as_str(), "run_b");
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
