//! Fan-out event bus for stream subscribers.
//!
//! Built on [`tokio::sync::broadcast`] so every subscriber receives every
//! published message without blocking the others. The bus retains no
//! history — late subscribers only see messages published after they
//! subscribed. A heartbeat task keeps idle subscribers able to detect
//! liveness.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const DEFAULT_CAPACITY: usize = 256;
/// Interval between heartbeat messages on each stream.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// The streams clients can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Tasks,
    Thoughts,
    Timeline,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: Topic,
    /// Message kind, e.g. "task_update", "thought", "heartbeat".
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn is_heartbeat(&self) -> bool {
        self.kind == "heartbeat"
    }
}

/// Shared bus handle. Clone it cheaply — all clones share the same
/// underlying channels. Handed to the store and runtime as a plain value,
/// never reached through a global.
#[derive(Clone, Debug)]
pub struct Bus {
    tasks: broadcast::Sender<BusEvent>,
    thoughts: broadcast::Sender<BusEvent>,
    timeline: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tasks, _) = broadcast::channel(capacity);
        let (thoughts, _) = broadcast::channel(capacity);
        let (timeline, _) = broadcast::channel(capacity);
        Self { tasks, thoughts, timeline }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<BusEvent> {
        match topic {
            Topic::Tasks => &self.tasks,
            Topic::Thoughts => &self.thoughts,
            Topic::Timeline => &self.timeline,
        }
    }

    /// Publish a message. Returns the number of subscribers that saw it;
    /// zero subscribers is not an error.
    pub fn publish(&self, topic: Topic, kind: &str, payload: serde_json::Value) -> usize {
        let event = BusEvent {
            topic,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.sender(topic).send(event).unwrap_or(0)
    }

    /// Subscribe to a stream. Dropping the receiver detaches the subscriber.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BusEvent> {
        self.sender(topic).subscribe()
    }

    /// Number of live subscribers on a stream.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    /// Spawn the heartbeat task: every 15 s, a heartbeat message on each
    /// stream, until the token is cancelled.
    pub fn spawn_heartbeat(&self, token: CancellationToken) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        for topic in [Topic::Tasks, Topic::Thoughts, Topic::Timeline] {
                            bus.publish(topic, "heartbeat", serde_json::json!({}));
                        }
                    }
                }
            }
        });
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
