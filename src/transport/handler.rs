//! Turns inbound text frames into broker operations and replies.
//!
//! Every valid request gets exactly one reply on the sender's own queue:
//! `ack` for publish, subscribe and unsubscribe, `pong` for ping. Invalid
//! requests get a `BAD_REQUEST` error and leave broker state untouched.
//! Subscribe replies come from the coordinator, after any replayed events.

use std::sync::Arc;

use tracing::debug;

use crate::broker::BrokerHandle;
use crate::client::Client;
use crate::transport::message::{ClientMessage, Request, ServerMessage};
use crate::utils::error::ProtocolError;

fn reply(client: &Client, message: ServerMessage) {
    if let Some(frame) = message.to_frame() {
        client.deliver(frame);
    }
}

/// Report a malformed request back to `client`.
pub fn reject(client: &Client, request_id: Option<String>, err: &ProtocolError) {
    debug!(client_id = %client.id, error = %err, "bad request");
    reply(client, ServerMessage::bad_request(request_id, err));
}

pub fn handle_text(client: &Arc<Client>, broker: &BrokerHandle, text: &str) {
    let decoded = match ClientMessage::decode(text) {
        Ok(decoded) => decoded,
        Err(err) => return reject(client, None, &err),
    };
    let request_id = decoded.request_id();
    let request = match decoded.into_request() {
        Ok(request) => request,
        Err(err) => return reject(client, request_id, &err),
    };

    match request {
        Request::Publish { topic, message } => {
            debug!(client_id = %client.id, %topic, message_id = %message.id, "publish");
            broker.publish(topic.clone(), message);
            reply(client, ServerMessage::ack(request_id, topic));
        }
        Request::Subscribe {
            topic,
            client_id,
            last_n,
        } => {
            debug!(client_id = %client.id, declared = %client_id, %topic, last_n, "subscribe");
            // The coordinator queues the replay and the ack.
            broker.subscribe(client, topic, last_n, request_id);
        }
        Request::Unsubscribe { topic, client_id } => {
            debug!(client_id = %client.id, declared = %client_id, %topic, "unsubscribe");
            broker.unsubscribe(&client.id, topic.clone());
            reply(client, ServerMessage::ack(request_id, topic));
        }
        Request::Ping => reply(client, ServerMessage::pong(request_id)),
    }
}
