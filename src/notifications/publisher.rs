use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub const PUBLIC_CHANNEL: &str = "public-channel";

pub const EVENT_STATUS_CHANGED: &str = "host-service-status-changed";
pub const EVENT_COUNT_CHANGED: &str = "host-service-count-changed";
pub const EVENT_SCHEDULE_CHANGED: &str = "schedule-changed-event";
pub const EVENT_SCHEDULE_ITEM_REMOVED: &str = "schedule-item-removed-event";
pub const EVENT_NEXT_RUN: &str = "next-run-event";
pub const EVENT_APP_STARTING: &str = "app-starting";
pub const EVENT_APP_STOPPING: &str = "app-stopping";

pub type Payload = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Event channel is closed: {0}")]
    ChannelClosed(String),
    #[error("Publish rejected: {0}")]
    Rejected(String),
}

/// Realtime pub/sub sink for dashboard events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, payload: Payload) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedEvent {
    pub channel: String,
    pub event: String,
    pub payload: Payload,
}

/// In-process publisher. Subscribers (websocket bridges, loggers, tests)
/// receive every event; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    events_tx: broadcast::Sender<PublishedEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self { events_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events_tx.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, channel: &str, event: &str, payload: Payload) -> Result<(), PublishError> {
        if self.events_tx.receiver_count() == 0 {
            trace!(channel, event, "No subscribers; dropping event.");
            return Ok(());
        }
        let message = PublishedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        };
        match self.events_tx.send(message) {
            Ok(receivers) => {
                debug!(channel, event, receivers, "Event published.");
                Ok(())
            }
            // Last receiver went away between the count check and the send.
            Err(e) => Err(PublishError::ChannelClosed(e.to_string())),
        }
    }
}
