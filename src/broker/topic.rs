//! Topic management
//!
//! A `Topic` is created and deleted only by administrative requests; it owns
//! its replay history and a monotonically increasing message counter.
//! Subscriber membership is not stored here: the coordinator owns it and
//! publishes per-topic subscriber counts, which `TopicRegistry::list` folds
//! into the snapshots it hands out.
//!
//! Concurrency note: the registry lives inside the broker's shared state and
//! is only touched under its `RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::message::Envelope;
use crate::broker::replay::ReplayBuffer;
use crate::utils::error::TopicError;

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
    replay: ReplayBuffer,
}

impl Topic {
    /// Create a new topic with an empty history of `replay_capacity` slots.
    pub fn new(name: &str, replay_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            message_count: 0,
            replay: ReplayBuffer::new(replay_capacity),
        }
    }

    /// Account for a published envelope and keep it for replay.
    pub fn record(&mut self, envelope: Arc<Envelope>) {
        self.message_count += 1;
        self.replay.append(envelope);
    }

    pub fn recent(&self, n: usize) -> Vec<Arc<Envelope>> {
        self.replay.recent(n)
    }
}

/// Point-in-time view of a topic, safe to hand to callers outside the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
    pub subscriber_count: usize,
}

#[derive(Debug)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
    replay_capacity: usize,
}

impl TopicRegistry {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            replay_capacity,
        }
    }

    pub fn create(&mut self, name: &str) -> Result<(), TopicError> {
        if self.topics.contains_key(name) {
            return Err(TopicError::AlreadyExists(name.to_string()));
        }
        self.topics
            .insert(name.to_string(), Topic::new(name, self.replay_capacity));
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), TopicError> {
        self.topics
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TopicError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Topic> {
        self.topics.get_mut(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }

    /// Recent history of `name`; empty when the topic does not exist.
    pub fn recent(&self, name: &str, n: usize) -> Vec<Arc<Envelope>> {
        self.topics
            .get(name)
            .map(|topic| topic.recent(n))
            .unwrap_or_default()
    }

    /// Snapshot every topic, sorted by name.
    pub fn list(&self, subscriber_counts: &HashMap<String, usize>) -> Vec<TopicInfo> {
        let mut infos: Vec<TopicInfo> = self
            .topics
            .values()
            .map(|topic| TopicInfo {
                name: topic.name.clone(),
                created_at: topic.created_at,
                message_count: topic.message_count,
                subscriber_count: subscriber_counts.get(&topic.name).copied().unwrap_or(0),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
