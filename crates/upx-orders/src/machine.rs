//! Order lifecycle state machine.
//!
//! Owns the live order set and every transition on it:
//! - `submit`: pre-flight validation, placement, in-flight event buffering and
//!   in-doubt tracking for ambiguous failures
//! - `apply_event`: idempotent folding of exchange updates (trade ids deduped,
//!   cumulative fill only grows, states never regress)
//! - `check_timeouts` / `resolve`: business timeouts and the timeout policy
//! - `adopt` / `finalize_missing` / `resolve_in_doubt`: reconciliation hooks
//!
//! Terminal transitions notify, append to the audit ledger, then evict.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};
use upx_core::{
    ClientOrderId, DynLedger, DynNotifier, ExchangeOrderStatus, LedgerEntry, LifecycleEvent,
    Lineage, Order, OrderEvent, OrderKind, OrderRequest, OrderState, Price, Size,
};
use upx_rest::{DynGateway, OrderLookup};
use upx_telemetry::Metrics;

use crate::error::{OrderError, OrderResult};
use crate::ids::{IdGenerator, DEFAULT_ID_PREFIX};
use crate::policy::{DynTimeoutPolicy, StandardTimeoutPolicy, TimeoutDecision};
use crate::store::{InDoubtSubmission, OrderCell, OrderStore, Routed, DEFAULT_RECENT_CAPACITY};

// ============================================================================
// OrderConfig
// ============================================================================

/// Default business timeout for an order without events.
pub const DEFAULT_ORDER_TIMEOUT_SECS: u64 = 60;

/// Default minimum order notional in KRW.
pub const DEFAULT_MIN_NOTIONAL: i64 = 5000;

/// Default monitor tick.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1000;

fn default_id_prefix() -> String {
    DEFAULT_ID_PREFIX.to_string()
}

fn default_min_notional() -> Decimal {
    Decimal::from(DEFAULT_MIN_NOTIONAL)
}

fn default_order_timeout_secs() -> u64 {
    DEFAULT_ORDER_TIMEOUT_SECS
}

fn default_half() -> Decimal {
    Decimal::new(5, 1)
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_cooldown_secs() -> u64 {
    5
}

fn default_recent_capacity() -> usize {
    DEFAULT_RECENT_CAPACITY
}

fn default_monitor_interval_ms() -> u64 {
    DEFAULT_MONITOR_INTERVAL_MS
}

/// Order lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfig {
    /// Prefix of generated client order identifiers.
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Minimum order notional in the quote currency.
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,

    /// Seconds without an event before an order times out.
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,

    /// Timeout multiplier for partially filled orders.
    #[serde(default = "default_half")]
    pub partial_fill_timeout_scale: Decimal,

    /// Share of the remainder resubmitted after a partial fill times out.
    #[serde(default = "default_half")]
    pub partial_fill_reduce_ratio: Decimal,

    /// Resubmissions allowed per root before escalation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum seconds between two resubmissions of the same root.
    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,

    /// Finalized identifiers remembered to drop late events.
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Timeout monitor tick.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            id_prefix: default_id_prefix(),
            min_notional: default_min_notional(),
            order_timeout_secs: default_order_timeout_secs(),
            partial_fill_timeout_scale: default_half(),
            partial_fill_reduce_ratio: default_half(),
            max_retries: default_max_retries(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            recent_capacity: default_recent_capacity(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl OrderConfig {
    /// Idle time after which an order in `state` times out.
    pub fn timeout_for(&self, state: OrderState) -> Duration {
        let base_ms = i64::try_from(self.order_timeout_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let ms = match state {
            OrderState::PartiallyFilled => (Decimal::from(base_ms)
                * self.partial_fill_timeout_scale)
                .to_i64()
                .unwrap_or(base_ms),
            _ => base_ms,
        };
        Duration::milliseconds(ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retry_cooldown_secs).unwrap_or(i64::MAX))
    }

    pub fn monitor_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

/// Lookup key for an order: the exchange uuid when known.
pub fn lookup_for(order: &Order) -> OrderLookup {
    match &order.exchange_uuid {
        Some(uuid) => OrderLookup::Uuid(uuid.clone()),
        None => OrderLookup::Identifier(order.identifier.clone()),
    }
}

// ============================================================================
// Event folding
// ============================================================================

#[derive(Debug, Default)]
struct Folded {
    progressed: bool,
    target: Option<OrderState>,
    learned_uuid: Option<String>,
}

/// Fold one exchange update into an order. Never lowers `filled`.
fn fold_event(order: &mut Order, event: &OrderEvent) -> Folded {
    let mut folded = Folded::default();

    if order.exchange_uuid.is_none() {
        if let Some(uuid) = &event.exchange_uuid {
            order.exchange_uuid = Some(uuid.clone());
            folded.learned_uuid = Some(uuid.clone());
        }
    }

    let mut new_trade = None;
    if let Some(trade) = &event.trade {
        if !order.applied_trades.insert(trade.trade_id.clone()) {
            trace!(identifier = %order.identifier, trade_id = %trade.trade_id, "Duplicate trade ignored");
            return folded;
        }
        new_trade = Some(trade);
    }

    let mut target_filled = order.filled;
    match (event.cumulative_filled(), new_trade) {
        (Some(cumulative), _) => target_filled = target_filled.max(cumulative),
        (None, Some(trade)) => target_filled = order.filled + trade.volume,
        (None, None) => {}
    }

    if let Some(requested) = order.requested_volume {
        if target_filled > requested {
            order.record_diagnostic(format!(
                "reported fill {target_filled} exceeds requested {requested}, clamped"
            ));
            target_filled = requested;
        }
    }

    if target_filled > order.filled {
        let delta = target_filled - order.filled;
        let delta_price = new_trade
            .map(|trade| trade.price)
            .or(event.price.filter(|_| order.kind == OrderKind::Limit));
        order.avg_fill_price = match (event.avg_price, delta_price) {
            (Some(avg), _) => Some(avg),
            (None, Some(price)) => Some(vwap(order.avg_fill_price, order.filled, price, delta)),
            (None, None) => order.avg_fill_price,
        };
        order.filled = target_filled;
        folded.progressed = true;
    }

    folded.target = match event.status {
        ExchangeOrderStatus::Done => Some(OrderState::Filled),
        ExchangeOrderStatus::Cancel | ExchangeOrderStatus::Prevented => {
            Some(OrderState::Cancelled)
        }
        ExchangeOrderStatus::Wait | ExchangeOrderStatus::Watch | ExchangeOrderStatus::Trade => {
            match order.requested_volume {
                Some(requested) if requested.is_positive() && order.filled >= requested => {
                    Some(OrderState::Filled)
                }
                _ if order.filled.is_positive() => Some(OrderState::PartiallyFilled),
                _ => None,
            }
        }
        ExchangeOrderStatus::Unknown => None,
    };

    folded
}

fn vwap(prev_avg: Option<Price>, prev_filled: Size, price: Price, delta: Size) -> Price {
    let total = prev_filled.inner() + delta.inner();
    if total.is_zero() {
        return price;
    }
    let prev = prev_avg.map(|p| p.inner()).unwrap_or(price.inner());
    Price::new((prev * prev_filled.inner() + price.inner() * delta.inner()) / total)
}

fn cancel_reason(status: ExchangeOrderStatus) -> &'static str {
    match status {
        ExchangeOrderStatus::Prevented => "self-trade prevented",
        _ => "cancelled at exchange",
    }
}

enum CancelOutcome {
    /// The exchange accepted the cancel.
    Cancelled,
    /// The order had already finished; it is finalized from the exchange view.
    AlreadyFinal,
}

// ============================================================================
// OrderStateMachine
// ============================================================================

pub struct OrderStateMachine {
    config: OrderConfig,
    gateway: DynGateway,
    notifier: DynNotifier,
    ledger: DynLedger,
    policy: DynTimeoutPolicy,
    ids: IdGenerator,
    store: OrderStore,
    /// Last resubmission time per lineage root.
    last_attempt: DashMap<ClientOrderId, DateTime<Utc>>,
}

impl OrderStateMachine {
    pub fn new(
        config: OrderConfig,
        gateway: DynGateway,
        notifier: DynNotifier,
        ledger: DynLedger,
    ) -> Self {
        let policy: DynTimeoutPolicy = Arc::new(StandardTimeoutPolicy::new(
            config.partial_fill_reduce_ratio,
            config.min_notional,
        ));
        Self {
            ids: IdGenerator::new(config.id_prefix.clone()),
            store: OrderStore::new(config.recent_capacity),
            last_attempt: DashMap::new(),
            config,
            gateway,
            notifier,
            ledger,
            policy,
        }
    }

    /// Replace the timeout policy.
    #[must_use]
    pub fn with_policy(mut self, policy: DynTimeoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &OrderConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get(&self, identifier: &ClientOrderId) -> Option<Order> {
        self.store.cell(identifier).map(|cell| cell.lock().clone())
    }

    /// Every non-terminal order, escalated ones included.
    pub fn live_orders(&self) -> Vec<Order> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|order| !order.state.is_terminal())
            .collect()
    }

    pub fn by_exchange_uuid(&self, uuid: &str) -> Option<Order> {
        self.store
            .identifier_for_uuid(uuid)
            .and_then(|identifier| self.get(&identifier))
    }

    /// Submissions whose outcome is unknown.
    pub fn in_doubt(&self) -> Vec<InDoubtSubmission> {
        self.store.in_doubt()
    }

    /// Live, in flight, in doubt or recently finalized.
    pub fn is_known(&self, identifier: &ClientOrderId) -> bool {
        self.store.knows(identifier)
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Validate and place an order.
    ///
    /// `reference_price` sizes the notional of market sells for the minimum
    /// order check. Nothing that fails validation reaches the exchange.
    pub async fn submit(
        &self,
        request: OrderRequest,
        reference_price: Option<Price>,
    ) -> OrderResult<Order> {
        if let Err(e) = request.validate(self.config.min_notional, reference_price) {
            Metrics::order_submit_failed("validation");
            warn!(market = %request.market, error = %e, "Order rejected before submission");
            return Err(OrderError::Validation(e.to_string()));
        }
        let identifier = self.ids.next();
        self.place(identifier, request, None, 0).await
    }

    async fn place(
        &self,
        identifier: ClientOrderId,
        request: OrderRequest,
        lineage: Option<Lineage>,
        retry_count: u32,
    ) -> OrderResult<Order> {
        debug!(%identifier, market = %request.market, side = %request.side, kind = %request.kind, "Submitting order");
        self.store.begin_in_flight(&identifier);

        match self.gateway.place_order(&identifier, &request).await {
            Ok(ack) => Ok(self.acknowledge(identifier, &request, lineage, retry_count, ack)),
            Err(e) if e.is_ambiguous() => {
                warn!(%identifier, error = %e, "Submission outcome unknown, looking it up once");
                let lookup = OrderLookup::Identifier(identifier.clone());
                match self.gateway.get_order(lookup).await {
                    Ok(Some(found)) => {
                        info!(%identifier, "Exchange knows the ambiguous submission");
                        return Ok(self.acknowledge(identifier, &request, lineage, retry_count, found));
                    }
                    Ok(None) => {}
                    Err(lookup_err) => {
                        warn!(%identifier, error = %lookup_err, "Lookup after ambiguous submission failed");
                    }
                }

                // The stream may have confirmed it while we were looking.
                if let Some(first) = self.store.first_buffered(&identifier) {
                    return Ok(self.acknowledge(identifier, &request, lineage, retry_count, first));
                }

                self.store.finish_in_flight(&identifier);
                self.store.mark_in_doubt(InDoubtSubmission {
                    identifier: identifier.clone(),
                    request,
                    lineage,
                    retry_count,
                    since: Utc::now(),
                });
                Metrics::order_submit_failed("in_doubt");
                Err(OrderError::InDoubt(identifier))
            }
            Err(e) => {
                self.store.finish_in_flight(&identifier);
                Metrics::order_submit_failed(e.kind());
                warn!(%identifier, error = %e, "Order submission failed");
                Err(e.into())
            }
        }
    }

    /// Insert an acknowledged order and replay anything the stream delivered
    /// while the submission was in flight.
    fn acknowledge(
        &self,
        identifier: ClientOrderId,
        request: &OrderRequest,
        lineage: Option<Lineage>,
        retry_count: u32,
        ack: OrderEvent,
    ) -> Order {
        let mut order = Order::accepted(
            identifier.clone(),
            request,
            ack.exchange_uuid.clone(),
            Utc::now(),
        );
        order.lineage = lineage;
        order.retry_count = retry_count;
        let cell = self.store.insert(order);

        info!(%identifier, exchange_uuid = ?ack.exchange_uuid, retry_count, "Order accepted");
        Metrics::order_transition("new", OrderState::Accepted.as_str());
        self.notifier.notify(&LifecycleEvent::Submitted {
            identifier: identifier.clone(),
            market: request.market.clone(),
            side: request.side,
            exchange_uuid: ack.exchange_uuid.clone(),
        });

        let buffered = self.store.finish_in_flight(&identifier);
        self.apply_to(&identifier, &cell, &ack);
        for event in &buffered {
            self.apply_to(&identifier, &cell, event);
        }
        self.refresh_live_gauge();

        let snapshot = cell.lock().clone();
        snapshot
    }

    // ------------------------------------------------------------------------
    // Exchange updates
    // ------------------------------------------------------------------------

    /// Apply an exchange update. Returns the order after the update, or
    /// `None` if the event was buffered, late or for an untracked order.
    pub fn apply_event(&self, event: OrderEvent) -> Option<Order> {
        let identifier = match &event.identifier {
            Some(identifier) => identifier.clone(),
            None => {
                let uuid = event.exchange_uuid.as_deref()?;
                match self.store.identifier_for_uuid(uuid) {
                    Some(identifier) => identifier,
                    None => {
                        debug!(exchange_uuid = uuid, "Event for untracked order");
                        return None;
                    }
                }
            }
        };

        if let Some(cell) = self.store.cell(&identifier) {
            return self.apply_to(&identifier, &cell, &event);
        }

        let event = match self.store.buffer(&identifier, event) {
            Routed::Buffered => {
                debug!(%identifier, "Event buffered until the submission is acknowledged");
                return None;
            }
            Routed::Live(cell, event) => return self.apply_to(&identifier, &cell, &event),
            Routed::Untracked(event) => event,
        };

        if self.store.recently_evicted(&identifier) {
            debug!(%identifier, status = ?event.status, "Late event for finalized order ignored");
            return None;
        }

        if let Some(doubt) = self.store.take_in_doubt(&identifier) {
            info!(%identifier, "Stream confirmed an in-doubt submission");
            return Some(self.acknowledge(
                doubt.identifier,
                &doubt.request,
                doubt.lineage,
                doubt.retry_count,
                event,
            ));
        }

        debug!(%identifier, "Event for untracked order, left to reconciliation");
        None
    }

    fn apply_tracked(&self, identifier: &ClientOrderId, event: &OrderEvent) -> Option<Order> {
        let cell = self.store.cell(identifier)?;
        self.apply_to(identifier, &cell, event)
    }

    fn apply_to(
        &self,
        identifier: &ClientOrderId,
        cell: &OrderCell,
        event: &OrderEvent,
    ) -> Option<Order> {
        let (snapshot, folded, moved) = {
            let mut order = cell.lock();
            if order.state.is_terminal() {
                return None;
            }
            let folded = fold_event(&mut order, event);
            let from = order.state;
            let moved = match folded.target {
                Some(to) if to != from && from.can_transition_to(to) => {
                    order.state = to;
                    Some((from, to))
                }
                _ => None,
            };
            if folded.progressed || moved.is_some() {
                order.last_event_at = Utc::now();
            }
            (order.clone(), folded, moved)
        };

        if let Some(uuid) = &folded.learned_uuid {
            self.store.index_uuid(uuid, identifier);
        }

        match moved {
            Some((from, to)) => {
                Metrics::order_transition(from.as_str(), to.as_str());
                debug!(%identifier, %from, %to, filled = %snapshot.filled, "Order transition");
                if to.is_terminal() {
                    self.finalize(&snapshot, cancel_reason(event.status));
                }
            }
            None if folded.progressed => {
                debug!(%identifier, filled = %snapshot.filled, "Fill applied");
            }
            None => trace!(%identifier, status = ?event.status, "Event changed nothing"),
        }
        Some(snapshot)
    }

    // ------------------------------------------------------------------------
    // Transitions and finalization
    // ------------------------------------------------------------------------

    fn transition(
        &self,
        identifier: &ClientOrderId,
        to: OrderState,
        diagnostic: Option<String>,
    ) -> Option<Order> {
        let cell = self.store.cell(identifier)?;
        let mut order = cell.lock();
        if !order.state.can_transition_to(to) {
            debug!(%identifier, from = %order.state, %to, "Transition not allowed");
            return None;
        }
        let from = order.state;
        order.state = to;
        order.last_event_at = Utc::now();
        if let Some(diagnostic) = diagnostic {
            order.record_diagnostic(diagnostic);
        }
        Metrics::order_transition(from.as_str(), to.as_str());
        Some(order.clone())
    }

    fn finalize(&self, order: &Order, reason: &str) {
        match order.state {
            OrderState::Filled => self.notifier.notify(&LifecycleEvent::Filled {
                identifier: order.identifier.clone(),
                filled: order.filled,
                avg_price: order.avg_fill_price,
            }),
            OrderState::Cancelled => self.notifier.notify(&LifecycleEvent::Cancelled {
                identifier: order.identifier.clone(),
                filled: order.filled,
                reason: reason.to_string(),
            }),
            OrderState::Retried => {}
            _ => return,
        }
        info!(
            identifier = %order.identifier,
            state = %order.state,
            filled = %order.filled,
            avg_price = ?order.avg_fill_price,
            reason,
            "Order finalized"
        );
        self.record_and_evict(order);
    }

    fn record_and_evict(&self, order: &Order) -> bool {
        match self.ledger.append(&LedgerEntry::from_order(order, Utc::now())) {
            Ok(()) => {
                self.store.evict(&order.identifier);
                if order.state != OrderState::Retried {
                    self.forget_lineage(order.root_identifier());
                }
                self.refresh_live_gauge();
                true
            }
            Err(e) => {
                error!(identifier = %order.identifier, error = %e, "Ledger append failed, order kept");
                self.notifier.notify(&LifecycleEvent::PersistentFailure {
                    context: format!("ledger append for {}", order.identifier),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Lineages still holding retry bookkeeping.
    pub fn tracked_lineages(&self) -> usize {
        self.last_attempt.len().max(self.ids.tracked_lineages())
    }

    /// Drop per-lineage bookkeeping once no order of the lineage remains.
    fn forget_lineage(&self, root: &ClientOrderId) {
        self.last_attempt.remove(root);
        self.ids.forget(root);
    }

    /// Retry ledger appends for finalized orders still held in the store.
    /// Returns the number evicted.
    pub fn flush_finalized(&self) -> usize {
        self.store
            .snapshot()
            .iter()
            .filter(|order| order.state.is_terminal())
            .filter(|order| self.record_and_evict(order))
            .count()
    }

    fn refresh_live_gauge(&self) {
        Metrics::orders_live_set(i64::try_from(self.store.len()).unwrap_or(i64::MAX));
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Move open orders idle past their timeout to `TimedOut`.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<ClientOrderId> {
        let mut timed_out = Vec::new();
        for cell in self.store.cells() {
            let (identifier, idle_secs) = {
                let mut order = cell.lock();
                if !order.state.is_open() {
                    continue;
                }
                let idle = now - order.last_event_at;
                if idle < self.config.timeout_for(order.state) {
                    continue;
                }
                Metrics::order_transition(order.state.as_str(), OrderState::TimedOut.as_str());
                order.state = OrderState::TimedOut;
                (order.identifier.clone(), idle.num_seconds())
            };

            Metrics::order_timeout();
            warn!(%identifier, idle_secs, "Order timed out");
            self.notifier.notify(&LifecycleEvent::TimedOut {
                identifier: identifier.clone(),
                idle_secs,
            });
            timed_out.push(identifier);
        }
        timed_out
    }

    /// Resolve every timed-out order. Failures are logged and retried on the
    /// next call.
    pub async fn resolve_timeouts(&self, now: DateTime<Utc>) {
        let pending: Vec<ClientOrderId> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|order| order.state == OrderState::TimedOut)
            .map(|order| order.identifier)
            .collect();

        for identifier in pending {
            if let Err(e) = self.resolve(&identifier, now).await {
                warn!(%identifier, error = %e, "Timed-out order not resolved");
            }
        }
    }

    /// Apply the timeout policy to one timed-out order.
    pub async fn resolve(&self, identifier: &ClientOrderId, now: DateTime<Utc>) -> OrderResult<()> {
        let order = self
            .get(identifier)
            .ok_or_else(|| OrderError::NotFound(identifier.clone()))?;
        if order.state != OrderState::TimedOut {
            return Err(OrderError::InvalidState {
                identifier: identifier.clone(),
                state: order.state.to_string(),
            });
        }

        let root = order.root_identifier().clone();
        let cooling = self
            .last_attempt
            .get(&root)
            .is_some_and(|last| now < *last.value() + self.config.retry_cooldown());
        if cooling {
            trace!(%identifier, %root, "Lineage cooling down");
            return Ok(());
        }

        let lookup = lookup_for(&order);
        match self.gateway.get_order(lookup.clone()).await? {
            Some(remote) if remote.status.is_final() => {
                info!(%identifier, status = ?remote.status, "Timed-out order already finished at exchange");
                self.apply_tracked(identifier, &remote);
                return Ok(());
            }
            Some(remote) => {
                self.apply_tracked(identifier, &remote);
            }
            None => {
                self.finalize_missing(identifier, "not found at exchange after timeout");
                return Ok(());
            }
        }

        let Some(order) = self.get(identifier).filter(|o| o.state == OrderState::TimedOut) else {
            return Ok(());
        };

        let mut decision = self.policy.decide(&order);
        if decision.resubmits() && order.retry_count >= self.config.max_retries {
            decision = TimeoutDecision::Escalate {
                reason: format!("retries exhausted after {} attempts", order.retry_count),
            };
        }
        info!(%identifier, decision = decision.as_str(), filled = %order.filled, "Timeout decision");

        match decision {
            TimeoutDecision::Cancel => {
                if let CancelOutcome::Cancelled = self.cancel_remote(identifier, lookup).await? {
                    if let Some(cancelled) = self.transition(identifier, OrderState::Cancelled, None)
                    {
                        self.finalize(&cancelled, "timed out");
                    }
                }
                Ok(())
            }
            TimeoutDecision::Escalate { reason } => {
                self.escalate(identifier, reason);
                Ok(())
            }
            TimeoutDecision::Retry => self.resubmit(identifier, lookup, None, None, now).await,
            TimeoutDecision::Amend { volume, price } => {
                self.resubmit(identifier, lookup, volume, price, now).await
            }
        }
    }

    async fn cancel_remote(
        &self,
        identifier: &ClientOrderId,
        lookup: OrderLookup,
    ) -> OrderResult<CancelOutcome> {
        match self.gateway.cancel_order(lookup.clone()).await {
            Ok(mut ack) => {
                // Fold fills only; the caller decides the resulting state.
                ack.status = ExchangeOrderStatus::Wait;
                self.apply_tracked(identifier, &ack);
                Ok(CancelOutcome::Cancelled)
            }
            Err(e) => {
                warn!(%identifier, error = %e, "Cancel failed, checking exchange state");
                match self.gateway.get_order(lookup).await {
                    Ok(Some(remote)) if remote.status.is_final() => {
                        self.apply_tracked(identifier, &remote);
                        Ok(CancelOutcome::AlreadyFinal)
                    }
                    Ok(None) if e.is_not_found() => {
                        self.finalize_missing(identifier, "not found at exchange on cancel");
                        Ok(CancelOutcome::AlreadyFinal)
                    }
                    _ => Err(e.into()),
                }
            }
        }
    }

    async fn resubmit(
        &self,
        identifier: &ClientOrderId,
        lookup: OrderLookup,
        volume: Option<Size>,
        price: Option<Price>,
        now: DateTime<Utc>,
    ) -> OrderResult<()> {
        if let CancelOutcome::AlreadyFinal = self.cancel_remote(identifier, lookup).await? {
            return Ok(());
        }
        let Some(order) = self.get(identifier).filter(|o| o.state == OrderState::TimedOut) else {
            return Ok(());
        };

        let Some(request) = self.successor_request(&order, volume, price) else {
            if let Some(cancelled) = self.transition(
                identifier,
                OrderState::Cancelled,
                Some("remainder too small to resubmit".to_string()),
            ) {
                self.finalize(&cancelled, "timed out");
            }
            return Ok(());
        };

        let Some(retired) = self.transition(identifier, OrderState::Retried, None) else {
            return Ok(());
        };
        self.finalize(&retired, "resubmitted");

        let root = retired.root_identifier().clone();
        self.last_attempt.insert(root.clone(), now);
        let (successor, attempt) = self.ids.next_retry(&root);
        info!(%identifier, %successor, attempt, volume = ?request.volume, "Resubmitting timed-out order");

        let lineage_root = root.clone();
        let lineage = Lineage {
            root,
            parent: identifier.clone(),
        };
        match self
            .place(successor.clone(), request, Some(lineage), retired.retry_count + 1)
            .await
        {
            Ok(_) => Ok(()),
            Err(e @ OrderError::InDoubt(_)) => Err(e),
            Err(e) => {
                error!(%successor, error = %e, "Resubmission failed");
                self.forget_lineage(&lineage_root);
                self.notifier.notify(&LifecycleEvent::PersistentFailure {
                    context: format!("resubmit {successor}"),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn successor_request(
        &self,
        order: &Order,
        volume: Option<Size>,
        price: Option<Price>,
    ) -> Option<OrderRequest> {
        let mut request = order.to_request();
        match order.kind {
            // Quote-amount orders are only resubmitted whole.
            OrderKind::Price if !order.filled.is_zero() => return None,
            OrderKind::Price => {}
            OrderKind::Limit | OrderKind::Market => {
                let remaining = order.remaining()?;
                let volume = volume.unwrap_or(remaining).min(remaining).truncate_to_exchange();
                if !volume.is_positive() {
                    return None;
                }
                request.volume = Some(volume);
            }
        }
        if let Some(price) = price {
            request = match order.kind {
                OrderKind::Limit => OrderRequest::limit(
                    request.market,
                    request.side,
                    request.volume.unwrap_or(Size::ZERO),
                    price,
                ),
                _ => request,
            };
        }
        request.validate(self.config.min_notional, None).ok()?;
        Some(request)
    }

    fn escalate(&self, identifier: &ClientOrderId, reason: String) {
        if self
            .transition(identifier, OrderState::Escalated, Some(reason.clone()))
            .is_some()
        {
            error!(%identifier, %reason, "Order escalated to operator");
            self.notifier.notify(&LifecycleEvent::Escalated {
                identifier: identifier.clone(),
                reason,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation hooks
    // ------------------------------------------------------------------------

    /// Finalize an order the exchange no longer knows as `Cancelled`.
    pub fn finalize_missing(&self, identifier: &ClientOrderId, diagnostic: &str) -> Option<Order> {
        let cancelled =
            self.transition(identifier, OrderState::Cancelled, Some(diagnostic.to_string()))?;
        warn!(%identifier, diagnostic, "Order missing at exchange, finalized as cancelled");
        self.finalize(&cancelled, diagnostic);
        Some(cancelled)
    }

    /// Start tracking an order found at the exchange but unknown locally.
    ///
    /// Idempotent: returns `None` for anything already known. An identifier
    /// matching an in-doubt submission is adopted with its own lineage.
    pub fn adopt(&self, event: &OrderEvent) -> Option<Order> {
        if let Some(uuid) = &event.exchange_uuid {
            if self.store.identifier_for_uuid(uuid).is_some() {
                return None;
            }
        }

        if let Some(identifier) = &event.identifier {
            if let Some(doubt) = self.store.take_in_doubt(identifier) {
                info!(%identifier, "In-doubt submission found at exchange");
                return Some(self.acknowledge(
                    doubt.identifier,
                    &doubt.request,
                    doubt.lineage,
                    doubt.retry_count,
                    event.clone(),
                ));
            }
        }

        let identifier = event.identifier.clone().or_else(|| {
            event
                .exchange_uuid
                .as_ref()
                .map(|uuid| ClientOrderId::from_string(format!("ext-{uuid}")))
        })?;
        if self.store.knows(&identifier) {
            return None;
        }

        let (Some(market), Some(side), Some(kind)) = (event.market.clone(), event.side, event.kind)
        else {
            warn!(%identifier, "Snapshot lacks market, side or kind, order not adopted");
            return None;
        };
        let request = OrderRequest {
            market: market.clone(),
            side,
            kind,
            volume: event.requested_volume(),
            price: event.price,
            stop_reference: None,
        };

        let mut order = Order::accepted(
            identifier.clone(),
            &request,
            event.exchange_uuid.clone(),
            Utc::now(),
        );
        order.externally_adopted = true;
        order.record_diagnostic("adopted from exchange snapshot");
        self.ids.observe(&identifier);
        let cell = self.store.insert(order);

        warn!(%identifier, exchange_uuid = ?event.exchange_uuid, %market, "Adopted order unknown locally");
        self.notifier.notify(&LifecycleEvent::AdoptedExternally {
            identifier: identifier.clone(),
            exchange_uuid: event.exchange_uuid.clone(),
            market,
        });

        self.apply_to(&identifier, &cell, event);
        self.refresh_live_gauge();
        let snapshot = cell.lock().clone();
        Some(snapshot)
    }

    /// Settle an in-doubt submission with what the exchange reports for it.
    ///
    /// `None` means the exchange never received it.
    pub fn resolve_in_doubt(
        &self,
        identifier: &ClientOrderId,
        remote: Option<OrderEvent>,
    ) -> Option<Order> {
        let doubt = self.store.take_in_doubt(identifier)?;
        match remote {
            Some(event) => Some(self.acknowledge(
                doubt.identifier,
                &doubt.request,
                doubt.lineage,
                doubt.retry_count,
                event,
            )),
            None => {
                warn!(%identifier, "In-doubt submission never reached the exchange");
                let root = doubt.lineage.map_or(doubt.identifier, |lineage| lineage.root);
                self.forget_lineage(&root);
                self.notifier.notify(&LifecycleEvent::PersistentFailure {
                    context: format!("submit {identifier}"),
                    error: "submission never reached the exchange".to_string(),
                });
                None
            }
        }
    }
}
