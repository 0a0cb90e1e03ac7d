//! # PubHub
//!
//! `pubhub` is an in-memory publish/subscribe broker. Clients speak a small
//! JSON protocol over WebSockets; topics are managed through an HTTP admin
//! API. Nothing is persisted.
//!
//! ## Core Modules
//!
//! - `broker`: topics, replay history, the routing coordinator and shutdown drain.
//! - `client`: a connection's identity, subscriptions and bounded outbound queue.
//! - `config`: layered configuration from defaults, file and environment.
//! - `transport`: wire protocol, WebSocket pumps and the admin API.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
