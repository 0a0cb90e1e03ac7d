use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::engine::{Broker, BrokerHandle};
use super::message::{Envelope, Message};
use super::replay::ReplayBuffer;
use super::shutdown::Lifecycle;
use super::topic::{Topic, TopicRegistry};
use crate::client::Client;
use crate::config::Settings;
use crate::transport::message::ServerMessage;
use crate::utils::error::TopicError;

fn message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        payload: json!({ "id": id }),
    }
}

fn envelope(id: &str) -> Arc<Envelope> {
    Arc::new(Envelope::new("t", message(id)))
}

fn ids(envelopes: &[Arc<Envelope>]) -> Vec<String> {
    envelopes.iter().map(|e| e.message.id.clone()).collect()
}

fn new_broker() -> (Broker, BrokerHandle) {
    let broker = Broker::new(&Settings::default());
    let handle = broker.handle();
    (broker, handle)
}

fn new_client() -> Arc<Client> {
    Arc::new(Client::new(8, Duration::from_millis(100)))
}

/// Apply every command the handle has queued so far.
fn pump(broker: &mut Broker) {
    while let Ok(command) = broker.commands.try_recv() {
        broker.apply(command);
    }
}

/// Decode every frame queued for `client`.
fn drain_frames(client: &Client) -> Vec<ServerMessage> {
    client
        .take_queued()
        .into_iter()
        .map(|frame| {
            let text = frame.into_text().expect("text frame");
            serde_json::from_str(text.as_str()).expect("valid server message")
        })
        .collect()
}

/// Ids of the events among `frames`, in queue order.
fn event_ids(frames: &[ServerMessage]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerMessage::Event { message, .. } => Some(message.id.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_replay_buffer_keeps_newest() {
    let mut buffer = ReplayBuffer::new(3);
    assert!(buffer.is_empty());
    for id in ["1", "2", "3", "4", "5"] {
        buffer.append(envelope(id));
    }
    assert_eq!(buffer.len(), 3);
    assert_eq!(ids(&buffer.recent(3)), vec!["3", "4", "5"]);
    assert_eq!(ids(&buffer.recent(2)), vec!["4", "5"]);
}

#[test]
fn test_replay_buffer_clamps_request() {
    let mut buffer = ReplayBuffer::new(5);
    buffer.append(envelope("1"));
    buffer.append(envelope("2"));
    assert_eq!(ids(&buffer.recent(10)), vec!["1", "2"]);
    assert_eq!(ids(&buffer.recent(0)), vec!["1", "2"]);
    assert!(ReplayBuffer::new(5).recent(3).is_empty());
}

#[test]
fn test_replay_buffer_zero_capacity() {
    let mut buffer = ReplayBuffer::new(0);
    assert_eq!(buffer.capacity(), 1);
    buffer.append(envelope("1"));
    buffer.append(envelope("2"));
    assert_eq!(ids(&buffer.recent(1)), vec!["2"]);
}

#[test]
fn test_topic_record() {
    let mut topic = Topic::new("test_topic", 2);
    assert_eq!(topic.name, "test_topic");
    assert_eq!(topic.message_count, 0);

    for id in ["a", "b", "c"] {
        topic.record(envelope(id));
    }
    assert_eq!(topic.message_count, 3);
    assert_eq!(ids(&topic.recent(0)), vec!["b", "c"]);
}

#[test]
fn test_registry_create_and_delete() {
    let mut registry = TopicRegistry::new(4);
    assert!(registry.create("orders").is_ok());
    assert_eq!(
        registry.create("orders"),
        Err(TopicError::AlreadyExists("orders".to_string()))
    );
    assert!(registry.delete("orders").is_ok());
    assert_eq!(
        registry.delete("orders"),
        Err(TopicError::NotFound("orders".to_string()))
    );
    assert_eq!(registry.len(), 0);
}

#[test]
fn test_registry_list_sorted_with_counts() {
    let mut registry = TopicRegistry::new(4);
    for name in ["zeta", "alpha", "mid"] {
        registry.create(name).expect("create");
    }
    let counts = [("mid".to_string(), 2)].into_iter().collect();

    let infos = registry.list(&counts);
    let names: Vec<&str> = infos.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    assert_eq!(infos[1].subscriber_count, 2);
    assert_eq!(infos[0].subscriber_count, 0);
}

#[test]
fn test_broker_new() {
    let (broker, handle) = new_broker();
    assert!(broker.clients.is_empty());
    assert!(handle.list_topics().is_empty());
    assert_eq!(handle.lifecycle(), Lifecycle::Running);

    let stats = handle.get_stats();
    assert_eq!(stats.total_clients, 0);
    assert_eq!(stats.total_topics, 0);
    assert_eq!(stats.total_messages, 0);
    assert_eq!(stats.active_topics, 0);
}

#[test]
fn test_broker_register_and_unregister_client() {
    let (mut broker, handle) = new_broker();
    let client = new_client();

    handle.register(client.clone());
    pump(&mut broker);
    assert!(broker.clients.contains_key(&client.id));
    assert_eq!(handle.get_stats().total_clients, 1);

    handle.unregister(&client.id);
    handle.unregister(&client.id);
    pump(&mut broker);
    assert!(!broker.clients.contains_key(&client.id));
    assert!(client.is_closed());
    assert_eq!(handle.get_stats().total_clients, 0);
}

#[tokio::test]
async fn test_publish_fans_out_to_subscribers() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("orders").expect("create");
    let (a, b, outsider) = (new_client(), new_client(), new_client());
    for client in [&a, &b, &outsider] {
        handle.register(client.clone());
    }
    handle.subscribe(&a, "orders", 0, None);
    handle.subscribe(&b, "orders", 0, None);
    handle.publish("orders", message("m1"));
    pump(&mut broker);

    for client in [&a, &b] {
        let frames = drain_frames(client);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerMessage::Ack { .. }));
        match &frames[1] {
            ServerMessage::Event { topic, message, .. } => {
                assert_eq!(topic, "orders");
                assert_eq!(message.id, "m1");
                assert_eq!(message.payload, json!({ "id": "m1" }));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }
    assert!(drain_frames(&outsider).is_empty());
    assert_eq!(handle.get_stats().total_messages, 1);
}

#[tokio::test]
async fn test_publish_to_unknown_topic_is_dropped() {
    let (mut broker, handle) = new_broker();
    let client = new_client();
    handle.register(client.clone());
    handle.subscribe(&client, "ghost", 0, None);
    handle.publish("ghost", message("m1"));
    pump(&mut broker);

    let frames = drain_frames(&client);
    assert_eq!(frames.len(), 1);
    assert!(matches!(frames[0], ServerMessage::Ack { .. }));
    assert_eq!(handle.get_stats().total_messages, 0);
    assert!(handle.recent("ghost", 0).is_empty());
}

#[test]
fn test_publish_without_subscribers_is_buffered() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("quiet").expect("create");
    handle.publish("quiet", message("m1"));
    handle.publish("quiet", message("m2"));
    pump(&mut broker);

    assert_eq!(ids(&handle.recent("quiet", 0)), vec!["m1", "m2"]);
    let topics = handle.list_topics();
    assert_eq!(topics[0].message_count, 2);
    assert_eq!(topics[0].subscriber_count, 0);
    assert_eq!(handle.get_stats().total_messages, 2);
}

#[test]
fn test_subscribe_is_idempotent() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("news").expect("create");
    let client = new_client();
    handle.register(client.clone());
    handle.subscribe(&client, "news", 0, None);
    handle.subscribe(&client, "news", 0, None);
    pump(&mut broker);

    assert_eq!(handle.list_topics()[0].subscriber_count, 1);
    assert_eq!(handle.get_stats().active_topics, 1);
    assert_eq!(client.subscriptions(), vec!["news"]);
}

#[test]
fn test_subscribe_from_unregistered_client_is_ignored() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("news").expect("create");
    let client = new_client();
    handle.subscribe(&client, "news", 0, None);
    pump(&mut broker);

    assert_eq!(handle.get_stats().active_topics, 0);
    assert!(!client.is_subscribed("news"));
}

#[test]
fn test_unsubscribe_prunes_empty_sets() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("news").expect("create");
    let client = new_client();
    handle.register(client.clone());
    handle.subscribe(&client, "news", 0, None);
    pump(&mut broker);
    assert_eq!(handle.get_stats().active_topics, 1);

    handle.unsubscribe(&client.id, "news");
    handle.unsubscribe(&client.id, "news");
    pump(&mut broker);
    assert_eq!(handle.get_stats().active_topics, 0);
    assert_eq!(handle.list_topics()[0].subscriber_count, 0);
    assert!(!client.is_subscribed("news"));
}

#[test]
fn test_unregister_removes_all_subscriptions() {
    let (mut broker, handle) = new_broker();
    let (a, b) = (new_client(), new_client());
    handle.register(a.clone());
    handle.register(b.clone());
    for topic in ["one", "two"] {
        handle.create_topic(topic).expect("create");
        handle.subscribe(&a, topic, 0, None);
    }
    handle.subscribe(&b, "two", 0, None);
    pump(&mut broker);
    assert_eq!(handle.get_stats().active_topics, 2);

    handle.unregister(&a.id);
    pump(&mut broker);
    let stats = handle.get_stats();
    assert_eq!(stats.active_topics, 1);
    assert_eq!(stats.total_clients, 1);
    assert!(a.subscriptions().is_empty());
    let two = handle
        .list_topics()
        .into_iter()
        .find(|t| t.name == "two")
        .expect("topic two");
    assert_eq!(two.subscriber_count, 1);
}

#[tokio::test]
async fn test_delete_topic_prunes_subscriptions() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("news").expect("create");
    let client = new_client();
    handle.register(client.clone());
    handle.subscribe(&client, "news", 0, None);
    handle.publish("news", message("m1"));
    pump(&mut broker);
    drain_frames(&client);

    handle.delete_topic("news").expect("delete");
    assert_eq!(
        handle.delete_topic("news"),
        Err(TopicError::NotFound("news".to_string()))
    );
    pump(&mut broker);
    assert!(!client.is_subscribed("news"));
    assert_eq!(handle.get_stats().active_topics, 0);
    assert!(handle.recent("news", 0).is_empty());

    // Recreated topics start empty and without subscribers.
    handle.create_topic("news").expect("recreate");
    handle.publish("news", message("m2"));
    pump(&mut broker);
    assert!(drain_frames(&client).is_empty());
    assert_eq!(ids(&handle.recent("news", 0)), vec!["m2"]);
}

#[test]
fn test_create_topic_conflict() {
    let (_broker, handle) = new_broker();
    handle.create_topic("dup").expect("create");
    assert_eq!(
        handle.create_topic("dup"),
        Err(TopicError::AlreadyExists("dup".to_string()))
    );
    assert_eq!(handle.get_stats().total_topics, 1);
}

#[test]
fn test_register_while_draining_closes_client() {
    let (mut broker, handle) = new_broker();
    handle.shutdown();
    handle.shutdown();
    assert_eq!(handle.lifecycle(), Lifecycle::Draining);
    assert!(handle.is_draining());

    let client = new_client();
    handle.register(client.clone());
    pump(&mut broker);
    assert!(client.is_closed());
    assert!(broker.clients.is_empty());
}

/// Yield until the coordinator has registered `expected` clients.
async fn settle(handle: &BrokerHandle, expected: usize) {
    for _ in 0..100 {
        if handle.get_stats().total_clients == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("coordinator did not register {expected} clients");
}

/// Stand-in for a connection's read pump: unregister once closed.
fn unregister_on_close(handle: &BrokerHandle, client: &Arc<Client>) {
    let handle = handle.clone();
    let client = client.clone();
    tokio::spawn(async move {
        client.closed().await;
        handle.unregister(&client.id);
    });
}

#[tokio::test(start_paused = true)]
async fn test_idle_drain_finishes_before_first_poll() {
    let (broker, handle) = new_broker();
    let poll = Settings::default().shutdown.poll_interval();
    let client = new_client();
    handle.register(client.clone());
    unregister_on_close(&handle, &client);

    let coordinator = tokio::spawn(broker.run());
    settle(&handle, 1).await;
    handle.shutdown();

    let report = coordinator.await.expect("coordinator task");
    assert!(report.flushed);
    assert!(report.drain_elapsed < poll);
    assert_eq!(report.closed, 1);
    assert_eq!(report.remaining, 0);
    assert!(client.is_closed());
    assert_eq!(handle.lifecycle(), Lifecycle::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_connection_is_closed_at_drain_timeout() {
    let (broker, handle) = new_broker();
    let shutdown = Settings::default().shutdown;
    let stalled = new_client();
    handle.register(stalled.clone());
    unregister_on_close(&handle, &stalled);
    stalled.deliver(tungstenite::Message::text("never written"));

    let coordinator = tokio::spawn(broker.run());
    settle(&handle, 1).await;
    handle.shutdown();

    let report = coordinator.await.expect("coordinator task");
    assert!(!report.flushed);
    assert!(report.drain_elapsed >= shutdown.drain_timeout());
    assert!(report.drain_elapsed < shutdown.drain_timeout() + shutdown.poll_interval());
    assert_eq!(report.closed, 1);
    assert_eq!(report.remaining, 0);
    assert!(stalled.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_connection_counts_as_remaining() {
    let (broker, handle) = new_broker();
    let client = new_client();
    handle.register(client.clone());

    let coordinator = tokio::spawn(broker.run());
    settle(&handle, 1).await;
    handle.shutdown();

    let report = coordinator.await.expect("coordinator task");
    assert!(report.flushed);
    assert_eq!(report.remaining, 1);
    assert_eq!(handle.lifecycle(), Lifecycle::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_served_while_draining() {
    let (broker, handle) = new_broker();
    handle.create_topic("news").expect("create");
    let client = new_client();
    handle.register(client.clone());
    unregister_on_close(&handle, &client);

    let coordinator = tokio::spawn(broker.run());
    settle(&handle, 1).await;
    // Keep one frame pending so the drain has to wait.
    client.deliver(tungstenite::Message::text("pending"));
    handle.shutdown();
    handle.publish("news", message("late"));

    let report = coordinator.await.expect("coordinator task");
    assert_eq!(report.remaining, 0);
    assert_eq!(handle.get_stats().total_messages, 1);
}

#[tokio::test]
async fn test_evicted_subscriber_gets_slow_consumer_frame_last() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("firehose").expect("create");
    let subscriber = Arc::new(Client::new(4, Duration::from_millis(100)));
    handle.register(subscriber.clone());
    handle.subscribe(&subscriber, "firehose", 0, None);
    for n in 0..2 {
        handle.publish("firehose", message(&format!("m{n}")));
    }
    pump(&mut broker);

    subscriber.evict_slow_consumer();
    for n in 2..4 {
        handle.publish("firehose", message(&format!("m{n}")));
    }
    pump(&mut broker);
    assert!(subscriber.is_slow_consumer());
    assert_eq!(handle.get_stats().total_messages, 4);

    let frames = drain_frames(&subscriber);
    assert_eq!(frames.len(), 4);
    assert!(matches!(frames[0], ServerMessage::Ack { .. }));
    assert_eq!(event_ids(&frames), vec!["m0", "m1"]);
    match &frames[3] {
        ServerMessage::Error { error, .. } => {
            assert_eq!(error.code, crate::transport::message::ErrorCode::SlowConsumer)
        }
        other => panic!("expected SLOW_CONSUMER, got {other:?}"),
    }
}

#[test]
fn test_subscribe_replays_publishes_submitted_before_it() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("orders").expect("create");
    let client = new_client();
    handle.register(client.clone());
    for id in ["m1", "m2", "m3"] {
        handle.publish("orders", message(id));
    }
    handle.subscribe(&client, "orders", 5, Some("sub-1".to_string()));
    pump(&mut broker);

    let frames = drain_frames(&client);
    assert_eq!(frames.len(), 4);
    assert_eq!(event_ids(&frames), vec!["m1", "m2", "m3"]);
    match &frames[3] {
        ServerMessage::Ack {
            request_id, topic, ..
        } => {
            assert_eq!(request_id.as_deref(), Some("sub-1"));
            assert_eq!(topic, "orders");
        }
        other => panic!("expected ack last, got {other:?}"),
    }
}

#[test]
fn test_publish_after_subscribe_is_delivered_live_once() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("orders").expect("create");
    let client = new_client();
    handle.register(client.clone());
    handle.publish("orders", message("m1"));
    handle.subscribe(&client, "orders", 5, None);
    handle.publish("orders", message("m2"));
    pump(&mut broker);

    let frames = drain_frames(&client);
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[1], ServerMessage::Ack { .. }));
    assert_eq!(event_ids(&frames), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_unconsumed_subscriber_keeps_newest_messages() {
    let (mut broker, handle) = new_broker();
    handle.create_topic("firehose").expect("create");
    let subscriber = Arc::new(Client::new(3, Duration::from_millis(100)));
    handle.register(subscriber.clone());
    handle.subscribe(&subscriber, "firehose", 0, None);
    for n in 1..=4 {
        handle.publish("firehose", message(&format!("m{n}")));
    }
    pump(&mut broker);

    assert!(!subscriber.is_slow_consumer());
    assert_eq!(event_ids(&drain_frames(&subscriber)), vec!["m2", "m3", "m4"]);
}
