use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::message::ServerMessage;

pub type ClientId = String;

/// Lifecycle of a connection as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// Overflowed its queue; only the terminal error frame is still queued.
    SlowConsumer,
    Closed,
}

/// What happened to a frame handed to [`Client::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full; its oldest frame was discarded to make room.
    ReplacedOldest,
    /// The connection is no longer active and the frame was discarded.
    Dropped,
    /// No room could be made; the connection is being evicted.
    SlowConsumer,
}

#[derive(Debug)]
struct ClientState {
    phase: ConnectionState,
    slow_consumer: bool,
    subscriptions: HashSet<String>,
    queue: VecDeque<WsMessage>,
    /// Set while the writer holds a dequeued frame it has not finished writing.
    in_flight: bool,
}

/// Drop-oldest-keep-newest swap on a full queue.
///
/// Removes exactly one queued frame, then enqueues `frame` in the freed
/// slot. Hands `frame` back when either step cannot complete.
pub(crate) fn make_room(
    queue: &mut VecDeque<WsMessage>,
    capacity: usize,
    frame: WsMessage,
) -> Result<(), WsMessage> {
    if queue.pop_front().is_none() {
        return Err(frame);
    }
    if queue.len() >= capacity {
        return Err(frame);
    }
    queue.push_back(frame);
    Ok(())
}

/// Represents a connected WebSocket client in the Pub/Sub system.
///
/// Each client owns a bounded outbound queue of `capacity` frames drained
/// by its connection's writer. Producers never block on it: [`deliver`]
/// either enqueues, replaces the oldest frame, or evicts the client. The
/// queue lives under the same short-lived lock as the rest of the
/// connection state and is never held across an await.
///
/// [`deliver`]: Client::deliver
#[derive(Debug)]
pub struct Client {
    /// Server-assigned identifier, unique per connection.
    pub id: ClientId,
    capacity: usize,
    slow_consumer_grace: Duration,
    state: Mutex<ClientState>,
    ready: Notify,
    closed: CancellationToken,
}

impl Client {
    /// Create a client whose queue holds `capacity` frames (at least one).
    pub fn new(capacity: usize, slow_consumer_grace: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: Uuid::new_v4().to_string(),
            capacity,
            slow_consumer_grace,
            state: Mutex::new(ClientState {
                phase: ConnectionState::Active,
                slow_consumer: false,
                subscriptions: HashSet::new(),
                // One extra slot for the SLOW_CONSUMER notice.
                queue: VecDeque::with_capacity(capacity + 1),
                in_flight: false,
            }),
            ready: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.is_cancelled() {
            return ConnectionState::Closed;
        }
        self.state.lock().phase
    }

    pub fn is_slow_consumer(&self) -> bool {
        self.state.lock().slow_consumer
    }

    /// Frames currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queued frames plus the one being written, if any.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + usize::from(state.in_flight)
    }

    /// Enqueue `frame` without blocking.
    ///
    /// On a full queue the oldest queued frame is discarded and `frame`
    /// takes its place. If no room can be made the client is marked a slow
    /// consumer: the SLOW_CONSUMER notice goes into the slot kept for it and
    /// the connection is closed after the grace delay.
    pub fn deliver(&self, frame: WsMessage) -> Delivery {
        let mut state = self.state.lock();
        if state.phase != ConnectionState::Active || self.closed.is_cancelled() {
            return Delivery::Dropped;
        }

        if state.queue.len() < self.capacity {
            state.queue.push_back(frame);
            drop(state);
            self.ready.notify_one();
            return Delivery::Queued;
        }

        match make_room(&mut state.queue, self.capacity, frame) {
            Ok(()) => {
                debug!(client_id = %self.id, "outbound queue full, dropped oldest frame");
                drop(state);
                self.ready.notify_one();
                Delivery::ReplacedOldest
            }
            Err(_) => {
                self.mark_slow(&mut state);
                drop(state);
                self.ready.notify_one();
                Delivery::SlowConsumer
            }
        }
    }

    fn mark_slow(&self, state: &mut ClientState) {
        state.phase = ConnectionState::SlowConsumer;
        state.slow_consumer = true;
        warn!(client_id = %self.id, capacity = self.capacity, "slow consumer, closing connection");

        if let Some(frame) = ServerMessage::slow_consumer().to_frame() {
            state.queue.push_back(frame);
        }

        let closed = self.closed.clone();
        let grace = self.slow_consumer_grace;
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    closed.cancel();
                });
            }
            Err(_) => closed.cancel(),
        }
    }

    /// Wait for the next outbound frame. Used by the connection writer, which
    /// must call [`frame_written`](Client::frame_written) once the frame is out.
    pub async fn next_frame(&self) -> WsMessage {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.queue.pop_front() {
                    state.in_flight = true;
                    return frame;
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn frame_written(&self) {
        self.state.lock().in_flight = false;
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.state.lock().phase = ConnectionState::Closed;
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn add_subscription(&self, topic: &str) -> bool {
        self.state.lock().subscriptions.insert(topic.to_string())
    }

    pub fn remove_subscription(&self, topic: &str) -> bool {
        self.state.lock().subscriptions.remove(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().subscriptions.contains(topic)
    }

    /// Subscribed topics, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().subscriptions.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn clear_subscriptions(&self) {
        self.state.lock().subscriptions.clear();
    }

    /// Remove and return everything queued.
    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Vec<WsMessage> {
        self.state.lock().queue.drain(..).collect()
    }

    /// Evict the client as if its queue could not make room.
    #[cfg(test)]
    pub(crate) fn evict_slow_consumer(&self) {
        let mut state = self.state.lock();
        self.mark_slow(&mut state);
    }
}
