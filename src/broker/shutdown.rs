//! Graceful shutdown of the broker.
//!
//! Once shutdown is requested the coordinator stops admitting connections
//! and waits for every live connection to flush its queue, polling every
//! `poll_interval` up to `drain_timeout`. Stragglers are then force-closed
//! and the coordinator keeps serving commands until their pumps have
//! unregistered or `unregister_timeout` runs out.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::broker::engine::Broker;

/// Broker lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Draining,
    Terminated,
}

/// Outcome of a drain, returned by [`Broker::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every connection flushed its queue before the drain timeout.
    pub flushed: bool,
    /// Connections the server closed at the end of the drain phase.
    pub closed: usize,
    /// Connections that had not unregistered when the coordinator stopped.
    pub remaining: usize,
    /// Time spent waiting for queues to flush.
    pub drain_elapsed: Duration,
}

impl Broker {
    pub(crate) async fn drain(&mut self) -> ShutdownReport {
        self.set_lifecycle(Lifecycle::Draining);
        info!(clients = self.clients.len(), "draining connections");

        let started = Instant::now();
        let flushed = self.wait_for_flush().await;
        let drain_elapsed = started.elapsed();

        let closed = self.clients.len();
        for client in self.clients.values() {
            client.close();
        }
        if closed > 0 {
            info!(closed, "closing remaining connections");
        }

        let remaining = self.wait_for_unregister().await;
        self.set_lifecycle(Lifecycle::Terminated);
        info!(flushed, closed, remaining, "broker stopped");

        ShutdownReport {
            flushed,
            closed,
            remaining,
            drain_elapsed,
        }
    }

    fn all_flushed(&self) -> bool {
        self.clients.values().all(|client| client.pending() == 0)
    }

    async fn wait_for_flush(&mut self) -> bool {
        let deadline = time::sleep(self.shutdown_settings.drain_timeout());
        tokio::pin!(deadline);

        let period = self
            .shutdown_settings
            .poll_interval()
            .max(Duration::from_millis(1));
        let mut poll = time::interval(period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    warn!(clients = self.clients.len(), "drain timeout reached");
                    return false;
                }
                _ = poll.tick() => {
                    if self.all_flushed() {
                        return true;
                    }
                }
                Some(command) = self.commands.recv() => self.apply(command),
            }
        }
    }

    async fn wait_for_unregister(&mut self) -> usize {
        let deadline = time::sleep(self.shutdown_settings.unregister_timeout());
        tokio::pin!(deadline);

        while !self.clients.is_empty() {
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => self.apply(command),
                _ = &mut deadline => {
                    warn!(remaining = self.clients.len(), "connections did not unregister in time");
                    break;
                }
            }
        }
        self.clients.len()
    }
}
