//! The `client` module defines the broker-side representation of a connection.
//!
//! A `Client` holds the connection's identity, its subscription set and the
//! bounded outbound queue that decouples publishers from the network writer.

pub mod pubsub_client;
pub use pubsub_client::{Client, ClientId, ConnectionState, Delivery};
