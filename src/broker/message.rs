//! Message definitions for the broker
//!
//! `Message` is what a publisher hands over: a caller-assigned `id` and an
//! arbitrary JSON `payload`. The broker never inspects either.
//!
//! `Envelope` is the routing unit the coordinator builds at publish time. It
//! is immutable and shared (`Arc<Envelope>`) between a topic's replay buffer
//! and the frames fanned out to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub topic: String,
    pub message: Message,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Stamp `message` for `topic` with the current time.
    pub fn new(topic: impl Into<String>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message,
            timestamp: Utc::now(),
        }
    }
}
