//! The broker coordinator and its handle.
//!
//! All routing state changes (registration, subscription, publish fan-out)
//! are serialized through a single coordinator task that owns the client
//! and subscription maps. Everything else talks to it through a cloneable
//! [`BrokerHandle`], which submits commands without waiting and answers
//! administrative queries from the shared state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::message::{Envelope, Message};
use crate::broker::shutdown::{Lifecycle, ShutdownReport};
use crate::broker::topic::{TopicInfo, TopicRegistry};
use crate::client::{Client, ClientId};
use crate::config::{BrokerSettings, Settings, ShutdownSettings};
use crate::transport::message::ServerMessage;
use crate::utils::error::TopicError;

#[derive(Debug)]
pub(crate) enum Command {
    Register(Arc<Client>),
    Unregister(ClientId),
    Publish { topic: String, message: Message },
    /// Replays up to `last_n` buffered events, then acks on the client's queue.
    Subscribe {
        client: Arc<Client>,
        topic: String,
        last_n: usize,
        request_id: Option<String>,
    },
    Unsubscribe { client_id: ClientId, topic: String },
    /// Prune routing for a topic removed by an admin request.
    DropTopic(String),
}

#[derive(Debug)]
pub(crate) struct BrokerState {
    pub topics: TopicRegistry,
    /// Live subscribers per topic, maintained by the coordinator.
    pub subscriber_counts: HashMap<String, usize>,
    pub total_clients: usize,
    pub total_messages: u64,
    pub started: Instant,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub total_clients: usize,
    pub total_topics: usize,
    pub total_messages: u64,
    /// Topics with at least one live subscriber.
    pub active_topics: usize,
    pub uptime: Duration,
}

/// Represents the broker that routes messages between clients.
///
/// Build one with [`Broker::new`], grab a [`BrokerHandle`], then drive the
/// coordinator with [`Broker::run`] until shutdown is requested.
pub struct Broker {
    pub(crate) shared: Arc<RwLock<BrokerState>>,
    pub(crate) clients: HashMap<ClientId, Arc<Client>>,
    subscriptions: HashMap<String, HashMap<ClientId, Arc<Client>>>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    sender: mpsc::UnboundedSender<Command>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) shutdown_settings: ShutdownSettings,
}

impl Broker {
    pub fn new(settings: &Settings) -> Self {
        Self::with_settings(&settings.broker, &settings.shutdown)
    }

    pub fn with_settings(broker: &BrokerSettings, shutdown: &ShutdownSettings) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let shared = BrokerState {
            topics: TopicRegistry::new(broker.replay_buffer_size),
            subscriber_counts: HashMap::new(),
            total_clients: 0,
            total_messages: 0,
            started: Instant::now(),
            lifecycle: Lifecycle::Running,
        };

        Self {
            shared: Arc::new(RwLock::new(shared)),
            clients: HashMap::new(),
            subscriptions: HashMap::new(),
            commands,
            sender,
            shutdown: CancellationToken::new(),
            shutdown_settings: shutdown.clone(),
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            commands: self.sender.clone(),
            shared: self.shared.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Serve commands until shutdown is requested, then drain.
    pub async fn run(mut self) -> ShutdownReport {
        info!("broker coordinator started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.apply(command),
            }
        }
        self.drain().await
    }

    pub(crate) fn apply(&mut self, command: Command) {
        match command {
            Command::Register(client) => self.register(client),
            Command::Unregister(client_id) => self.unregister(&client_id),
            Command::Publish { topic, message } => self.publish(topic, message),
            Command::Subscribe {
                client,
                topic,
                last_n,
                request_id,
            } => self.subscribe(client, topic, last_n, request_id),
            Command::Unsubscribe { client_id, topic } => self.unsubscribe(&client_id, &topic),
            Command::DropTopic(topic) => self.drop_topic(&topic),
        }
    }

    fn register(&mut self, client: Arc<Client>) {
        let mut shared = self.shared.write();
        if shared.lifecycle != Lifecycle::Running {
            drop(shared);
            info!(client_id = %client.id, "refusing registration while shutting down");
            client.close();
            return;
        }

        debug!(client_id = %client.id, "client registered");
        self.clients.insert(client.id.clone(), client);
        shared.total_clients = self.clients.len();
    }

    fn unregister(&mut self, client_id: &str) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        client.close();
        client.clear_subscriptions();

        let mut shared = self.shared.write();
        self.subscriptions.retain(|topic, subscribers| {
            if subscribers.remove(client_id).is_some() {
                if subscribers.is_empty() {
                    shared.subscriber_counts.remove(topic);
                } else {
                    shared
                        .subscriber_counts
                        .insert(topic.clone(), subscribers.len());
                }
            }
            !subscribers.is_empty()
        });
        shared.total_clients = self.clients.len();
        debug!(client_id, "client unregistered");
    }

    fn publish(&mut self, topic: String, message: Message) {
        let envelope = Arc::new(Envelope::new(topic, message));

        let recipients: Vec<Arc<Client>> = {
            let mut shared = self.shared.write();
            let Some(entry) = shared.topics.get_mut(&envelope.topic) else {
                debug!(topic = %envelope.topic, "publish to unknown topic dropped");
                return;
            };
            entry.record(envelope.clone());
            shared.total_messages += 1;

            match self.subscriptions.get(&envelope.topic) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return,
            }
        };

        let Some(frame) = ServerMessage::event(&envelope).to_frame() else {
            return;
        };
        for client in &recipients {
            client.deliver(frame.clone());
        }
        debug!(topic = %envelope.topic, recipients = recipients.len(), "message published");
    }

    fn subscribe(
        &mut self,
        client: Arc<Client>,
        topic: String,
        last_n: usize,
        request_id: Option<String>,
    ) {
        if !self.clients.contains_key(&client.id) {
            debug!(client_id = %client.id, "subscribe from unregistered client ignored");
            return;
        }

        client.add_subscription(&topic);
        let subscribers = self.subscriptions.entry(topic.clone()).or_default();
        subscribers.insert(client.id.clone(), client.clone());
        let count = subscribers.len();

        // History is read in the same step that installs the subscription,
        // so every message lands either in the replay or in the live feed.
        let history = {
            let mut shared = self.shared.write();
            shared.subscriber_counts.insert(topic.clone(), count);
            if last_n > 0 {
                shared.topics.recent(&topic, last_n)
            } else {
                Vec::new()
            }
        };

        for envelope in &history {
            if let Some(frame) = ServerMessage::event(envelope).to_frame() {
                client.deliver(frame);
            }
        }
        if let Some(frame) = ServerMessage::ack(request_id, topic).to_frame() {
            client.deliver(frame);
        }
    }

    fn unsubscribe(&mut self, client_id: &str, topic: &str) {
        let Some(subscribers) = self.subscriptions.get_mut(topic) else {
            return;
        };
        let Some(client) = subscribers.remove(client_id) else {
            return;
        };
        client.remove_subscription(topic);

        let count = subscribers.len();
        let mut shared = self.shared.write();
        if count == 0 {
            self.subscriptions.remove(topic);
            shared.subscriber_counts.remove(topic);
        } else {
            shared.subscriber_counts.insert(topic.to_string(), count);
        }
    }

    fn drop_topic(&mut self, topic: &str) {
        if let Some(subscribers) = self.subscriptions.remove(topic) {
            for client in subscribers.values() {
                client.remove_subscription(topic);
            }
            info!(topic, dropped = subscribers.len(), "subscriptions pruned for deleted topic");
        }
        self.shared.write().subscriber_counts.remove(topic);
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.shared.write().lifecycle = lifecycle;
    }
}

/// Cloneable front door to a running [`Broker`].
///
/// Routing calls only enqueue a command and return immediately. Admin calls
/// read or update the shared state under its lock and return a result.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<RwLock<BrokerState>>,
    shutdown: CancellationToken,
}

impl BrokerHandle {
    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("broker coordinator stopped, command dropped");
        }
    }

    pub fn register(&self, client: Arc<Client>) {
        if let Err(mpsc::error::SendError(Command::Register(client))) =
            self.commands.send(Command::Register(client))
        {
            client.close();
        }
    }

    pub fn unregister(&self, client_id: &str) {
        self.submit(Command::Unregister(client_id.to_string()));
    }

    pub fn publish(&self, topic: impl Into<String>, message: Message) {
        self.submit(Command::Publish {
            topic: topic.into(),
            message,
        });
    }

    /// Subscribe `client` to `topic`. Once applied, the last `last_n`
    /// buffered events and then an ack tagged `request_id` are queued for it.
    pub fn subscribe(
        &self,
        client: &Arc<Client>,
        topic: impl Into<String>,
        last_n: usize,
        request_id: Option<String>,
    ) {
        self.submit(Command::Subscribe {
            client: client.clone(),
            topic: topic.into(),
            last_n,
            request_id,
        });
    }

    pub fn unsubscribe(&self, client_id: &str, topic: impl Into<String>) {
        self.submit(Command::Unsubscribe {
            client_id: client_id.to_string(),
            topic: topic.into(),
        });
    }

    pub fn create_topic(&self, name: &str) -> Result<(), TopicError> {
        self.shared.write().topics.create(name)?;
        info!(topic = name, "topic created");
        Ok(())
    }

    /// Remove a topic and its history. Subscriptions to it are pruned by the
    /// coordinator shortly after.
    pub fn delete_topic(&self, name: &str) -> Result<(), TopicError> {
        self.shared.write().topics.delete(name)?;
        self.submit(Command::DropTopic(name.to_string()));
        info!(topic = name, "topic deleted");
        Ok(())
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.shared.read().topics.contains(name)
    }

    /// Snapshot of every topic, sorted by name.
    pub fn list_topics(&self) -> Vec<TopicInfo> {
        let shared = self.shared.read();
        shared.topics.list(&shared.subscriber_counts)
    }

    /// Up to `n` most recent envelopes of `topic`, oldest first; `n == 0` means all.
    pub fn recent(&self, topic: &str, n: usize) -> Vec<Arc<Envelope>> {
        self.shared.read().topics.recent(topic, n)
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let shared = self.shared.read();
        StatsSnapshot {
            total_clients: shared.total_clients,
            total_topics: shared.topics.len(),
            total_messages: shared.total_messages,
            active_topics: shared.subscriber_counts.len(),
            uptime: shared.started.elapsed(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.read().lifecycle
    }

    pub fn is_draining(&self) -> bool {
        self.lifecycle() != Lifecycle::Running
    }

    /// Request shutdown. Idempotent; the coordinator drains and then stops.
    pub fn shutdown(&self) {
        {
            let mut shared = self.shared.write();
            if shared.lifecycle == Lifecycle::Running {
                shared.lifecycle = Lifecycle::Draining;
                info!("shutdown requested");
            }
        }
        self.shutdown.cancel();
    }
}
