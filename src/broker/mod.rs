//! The `broker` module is the routing core: topics and their replay history,
//! the coordinator that owns subscriptions, and the shutdown drain.

pub mod engine;
pub mod message;
pub mod replay;
pub mod shutdown;
pub mod topic;

pub use engine::{Broker, BrokerHandle, StatsSnapshot};
pub use message::{Envelope, Message};
pub use shutdown::{Lifecycle, ShutdownReport};
pub use topic::TopicInfo;

#[cfg(test)]
mod tests;
