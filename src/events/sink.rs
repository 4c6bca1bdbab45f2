use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmEventKind {
    StateUpdate,
    ConfigUpdate,
    ResourceUpdate,
    TeamUpdate,
}

/// One notification addressed to a swarm's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub swarm_id: String,
    pub channel_id: String,
    pub kind: SwarmEventKind,
    pub message: Option<String>,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

/// Where resolved events are delivered
pub trait EventSink: Send + Sync {
    /// Returns the number of receivers reached
    fn deliver(&self, event: SwarmEvent) -> usize;
}

/// In-process fan-out over a tokio broadcast channel.
/// Slow subscribers lose the oldest events once `capacity` is buffered.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SwarmEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn deliver(&self, event: SwarmEvent) -> usize {
        let receivers = self.sender.send(event).unwrap_or(0);
        if receivers == 0 {
            debug!("No subscribers listening to swarm events");
        }
        receivers
    }
}
