//! The `transport` module is responsible for network communication.
//!
//! It defines the JSON protocol spoken over WebSockets, the handler that maps
//! requests onto broker operations, the per-connection read and write pumps,
//! and the administrative HTTP API.

pub mod handler;
pub mod message;
pub mod rest;
pub mod websocket;
