//! Reconciliation sweep and loop.
//!
//! Each sweep fetches the authoritative snapshot (open orders and accounts)
//! and diffs it against the state machine:
//! - tracked and listed: the remote cumulative fill is applied as an event
//! - tracked, not listed, past the grace period: fetched once and finalized
//! - listed, unknown: adopted (or confirmed, for in-doubt submissions)
//! - balances: compared with the stream portfolio; mismatches are notified,
//!   never corrected
//!
//! The loop sweeps at startup, on a fixed interval and whenever the stream
//! reports a gap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use upx_core::{ClientOrderId, DynNotifier, LifecycleEvent, OrderEvent, OrderState};
use upx_orders::{lookup_for, OrderStateMachine};
use upx_rest::{DynGateway, OrderLookup, RestError};
use upx_telemetry::Metrics;
use upx_ws::StreamEvent;

use crate::balance::{compare_balances, BalanceTolerance};
use crate::error::ReconResult;
use crate::portfolio::Portfolio;

/// Default sweep interval.
pub const DEFAULT_RECON_INTERVAL_SECS: u64 = 30;

/// Default age before a tracked order missing from the snapshot is looked up.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Consecutive failed sweeps before a persistent failure is notified.
const FAILURE_ALERT_THRESHOLD: u32 = 3;

fn default_interval_secs() -> u64 {
    DEFAULT_RECON_INTERVAL_SECS
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

/// Reconciliation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default)]
    pub balance_tolerance: BalanceTolerance,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            balance_tolerance: BalanceTolerance::default(),
        }
    }
}

impl ReconConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX))
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tracked orders whose fill or state moved from the snapshot.
    pub healed: usize,
    /// Tracked orders finalized because they left the exchange's open set.
    pub finalized: usize,
    /// Unknown orders adopted.
    pub adopted: usize,
    /// In-doubt submissions settled.
    pub confirmed: usize,
    /// Newly reported balance mismatches.
    pub mismatches: usize,
    /// Per-order lookups that failed; retried next sweep.
    pub errors: usize,
}

/// Event for a tracked order, keyed by its local identifier.
fn keyed(remote: &OrderEvent, identifier: &ClientOrderId) -> OrderEvent {
    let mut event = remote.clone();
    event.identifier = Some(identifier.clone());
    event
}

pub struct Reconciler {
    config: ReconConfig,
    machine: Arc<OrderStateMachine>,
    gateway: DynGateway,
    notifier: DynNotifier,
    portfolio: Arc<Portfolio>,
    /// Currencies currently reported as mismatched.
    reported: Mutex<HashSet<String>>,
    consecutive_failures: AtomicU32,
}

impl Reconciler {
    pub fn new(
        config: ReconConfig,
        machine: Arc<OrderStateMachine>,
        gateway: DynGateway,
        notifier: DynNotifier,
        portfolio: Arc<Portfolio>,
    ) -> Self {
        Self {
            config,
            machine,
            gateway,
            notifier,
            portfolio,
            reported: Mutex::new(HashSet::new()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// One full pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> ReconResult<SweepReport> {
        let open = match self.gateway.open_orders().await {
            Ok(open) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                open
            }
            Err(e) => {
                self.record_failure(&e);
                return Err(e.into());
            }
        };

        let mut report = SweepReport::default();
        self.reconcile_tracked(&open, now, &mut report).await;
        self.adopt_unknown(&open, &mut report);
        self.reconcile_in_doubt(&open, now, &mut report).await;
        self.reconcile_balances(&mut report).await;

        Metrics::recon_sweep(if report.errors == 0 { "ok" } else { "partial" });
        debug!(
            open = open.len(),
            healed = report.healed,
            finalized = report.finalized,
            adopted = report.adopted,
            confirmed = report.confirmed,
            mismatches = report.mismatches,
            errors = report.errors,
            "Reconciliation sweep complete"
        );
        Ok(report)
    }

    fn record_failure(&self, error: &RestError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        Metrics::recon_sweep("error");
        warn!(failures, error = %error, "Reconciliation snapshot fetch failed");
        if failures == FAILURE_ALERT_THRESHOLD {
            self.notifier.notify(&LifecycleEvent::PersistentFailure {
                context: "reconciliation snapshot".to_string(),
                error: error.to_string(),
            });
        }
    }

    async fn reconcile_tracked(
        &self,
        open: &[OrderEvent],
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let by_uuid: HashMap<&str, &OrderEvent> = open
            .iter()
            .filter_map(|e| e.exchange_uuid.as_deref().map(|uuid| (uuid, e)))
            .collect();
        let by_identifier: HashMap<&ClientOrderId, &OrderEvent> = open
            .iter()
            .filter_map(|e| e.identifier.as_ref().map(|id| (id, e)))
            .collect();
        let grace = self.config.grace_period();

        for order in self.machine.live_orders() {
            if order.state == OrderState::Escalated {
                continue;
            }

            let listed = order
                .exchange_uuid
                .as_deref()
                .and_then(|uuid| by_uuid.get(uuid))
                .or_else(|| by_identifier.get(&order.identifier))
                .copied();

            if let Some(remote) = listed {
                if let Some(updated) = self.machine.apply_event(keyed(remote, &order.identifier)) {
                    if updated.filled > order.filled || updated.state != order.state {
                        debug!(identifier = %order.identifier, filled = %updated.filled, "Healed from snapshot");
                        report.healed += 1;
                    }
                }
                continue;
            }

            if now - order.accepted_at < grace {
                trace!(identifier = %order.identifier, "Not listed yet, inside grace period");
                continue;
            }

            match self.gateway.get_order(lookup_for(&order)).await {
                Ok(Some(remote)) => {
                    let finished = remote.status.is_final();
                    self.machine.apply_event(keyed(&remote, &order.identifier));
                    if finished {
                        info!(identifier = %order.identifier, status = ?remote.status, "Finalized from exchange");
                        report.finalized += 1;
                    }
                }
                Ok(None) => {
                    if self
                        .machine
                        .finalize_missing(&order.identifier, "absent from open orders and not found")
                        .is_some()
                    {
                        report.finalized += 1;
                    }
                }
                Err(e) => {
                    warn!(identifier = %order.identifier, error = %e, "Order lookup failed");
                    report.errors += 1;
                }
            }
        }
    }

    fn adopt_unknown(&self, open: &[OrderEvent], report: &mut SweepReport) {
        for remote in open {
            let Some(order) = self.machine.adopt(remote) else {
                continue;
            };
            if order.externally_adopted {
                Metrics::recon_adopted();
                report.adopted += 1;
            } else {
                report.confirmed += 1;
            }
        }
    }

    async fn reconcile_in_doubt(
        &self,
        open: &[OrderEvent],
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let listed: HashSet<&ClientOrderId> =
            open.iter().filter_map(|e| e.identifier.as_ref()).collect();
        let grace = self.config.grace_period();

        for doubt in self.machine.in_doubt() {
            if listed.contains(&doubt.identifier) || now - doubt.since < grace {
                continue;
            }
            let lookup = OrderLookup::Identifier(doubt.identifier.clone());
            match self.gateway.get_order(lookup).await {
                Ok(remote) => {
                    let found = remote.is_some();
                    self.machine.resolve_in_doubt(&doubt.identifier, remote);
                    if found {
                        report.confirmed += 1;
                    }
                }
                Err(e) => {
                    warn!(identifier = %doubt.identifier, error = %e, "In-doubt lookup failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn reconcile_balances(&self, report: &mut SweepReport) {
        if self.portfolio.is_empty() {
            trace!("No stream balances yet, skipping balance check");
            return;
        }
        let accounts = match self.gateway.accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "Accounts fetch failed");
                report.errors += 1;
                return;
            }
        };

        let mismatches = compare_balances(
            &self.portfolio.balances(),
            &accounts,
            &self.config.balance_tolerance,
        );
        let mut reported = self.reported.lock();
        let current: HashSet<String> = mismatches.iter().map(|m| m.currency.clone()).collect();
        for mismatch in mismatches {
            if reported.contains(&mismatch.currency) {
                continue;
            }
            Metrics::balance_mismatch(&mismatch.currency);
            warn!(
                currency = %mismatch.currency,
                tracked = %mismatch.tracked,
                exchange = %mismatch.exchange,
                "Balance mismatch"
            );
            self.notifier.notify(&LifecycleEvent::BalanceMismatch {
                currency: mismatch.currency,
                tracked: mismatch.tracked,
                exchange: mismatch.exchange,
            });
            report.mismatches += 1;
        }
        *reported = current;
    }

    async fn sweep_logged(&self, trigger: &'static str) {
        match self.sweep(Utc::now()).await {
            Ok(report) => trace!(trigger, ?report, "Sweep finished"),
            Err(e) => warn!(trigger, error = %e, "Sweep failed"),
        }
    }

    /// Run until shutdown: bootstrap sweep, then interval and gap-triggered
    /// sweeps.
    pub async fn run(
        self: Arc<Self>,
        stream_events: Option<broadcast::Receiver<StreamEvent>>,
        shutdown: CancellationToken,
    ) {
        let interval = self.config.interval();
        info!(interval_secs = interval.as_secs(), "Reconciliation loop started");
        self.sweep_logged("bootstrap").await;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream_events = stream_events;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciliation loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_logged("interval").await;
                }
                event = next_stream_event(&mut stream_events) => match event {
                    Ok(StreamEvent::Resynced { reconnects }) => {
                        info!(reconnects, "Stream resynced, reconciling early");
                        self.sweep_logged("resync").await;
                        ticker.reset();
                    }
                    Ok(StreamEvent::FramesDropped { kind }) => {
                        let coalesced = drain_queued(&mut stream_events);
                        warn!(kind, coalesced, "Stream frames dropped, reconciling early");
                        self.sweep_logged("frames_dropped").await;
                        ticker.reset();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stream events lagged, reconciling early");
                        self.sweep_logged("resync").await;
                        ticker.reset();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Stream event channel closed");
                        stream_events = None;
                    }
                },
            }
        }
    }
}

/// Discard signals already queued; one sweep covers them all.
fn drain_queued(rx: &mut Option<broadcast::Receiver<StreamEvent>>) -> usize {
    let Some(rx) = rx else {
        return 0;
    };
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}

async fn next_stream_event(
    rx: &mut Option<broadcast::Receiver<StreamEvent>>,
) -> Result<StreamEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
