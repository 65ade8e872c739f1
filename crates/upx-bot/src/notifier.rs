//! Notifier that writes lifecycle events to the log.

use tracing::{error, info, warn};
use upx_core::{LifecycleEvent, Notifier};
use upx_telemetry::Metrics;

/// Logs every lifecycle event with structured fields and counts it by kind.
/// Events that need an operator are logged at `error`.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, event: &LifecycleEvent) {
        Metrics::lifecycle_event(event.kind());

        match event {
            LifecycleEvent::Submitted {
                identifier,
                market,
                side,
                exchange_uuid,
            } => info!(%identifier, %market, side = side.as_str(), ?exchange_uuid, "Order submitted"),
            LifecycleEvent::Filled {
                identifier,
                filled,
                avg_price,
            } => info!(%identifier, %filled, ?avg_price, "Order filled"),
            LifecycleEvent::Cancelled {
                identifier,
                filled,
                reason,
            } => info!(%identifier, %filled, %reason, "Order cancelled"),
            LifecycleEvent::TimedOut {
                identifier,
                idle_secs,
            } => warn!(%identifier, idle_secs, "Order timed out"),
            LifecycleEvent::Escalated { identifier, reason } => {
                error!(%identifier, %reason, "Order escalated, manual action required")
            }
            LifecycleEvent::AdoptedExternally {
                identifier,
                exchange_uuid,
                market,
            } => warn!(%identifier, ?exchange_uuid, %market, "Order adopted from exchange"),
            LifecycleEvent::BalanceMismatch {
                currency,
                tracked,
                exchange,
            } => error!(%currency, %tracked, %exchange, "Balance mismatch"),
            LifecycleEvent::PersistentFailure { context, error } => {
                error!(%context, %error, "Persistent failure")
            }
        }
    }
}
