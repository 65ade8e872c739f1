//! Background tasks around the state machine.
//!
//! - `TimeoutMonitor`: ticks at the configured interval, moves idle orders
//!   to `TimedOut`, resolves them through the policy and retries pending
//!   ledger appends
//! - `pump_events`: feeds stream order updates into `apply_event`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use upx_core::OrderEvent;

use crate::machine::OrderStateMachine;

pub struct TimeoutMonitor {
    machine: Arc<OrderStateMachine>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl TimeoutMonitor {
    pub fn new(machine: Arc<OrderStateMachine>, shutdown: CancellationToken) -> Self {
        let interval = machine.config().monitor_interval();
        Self {
            machine,
            interval,
            shutdown,
        }
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Timeout monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Timeout monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// One pass: detect, resolve, flush.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let timed_out = self.machine.check_timeouts(now);
        if !timed_out.is_empty() {
            debug!(count = timed_out.len(), "Orders timed out this tick");
        }
        self.machine.resolve_timeouts(now).await;
        self.machine.flush_finalized();
    }
}

/// Apply stream order updates until the channel closes or shutdown.
pub async fn pump_events(
    machine: Arc<OrderStateMachine>,
    mut events: mpsc::Receiver<OrderEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    machine.apply_event(event);
                }
                None => break,
            },
        }
    }
    debug!("Order event pump stopped");
}
