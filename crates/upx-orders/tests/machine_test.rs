//! Order state machine integration tests.
//!
//! Drives `OrderStateMachine` against `MockGateway`:
//! - Idempotent fill folding (duplicates, out-of-order cumulative updates)
//! - Timeout detection, cancel, retry with lineage, amend, cooldown, escalation
//! - Ambiguous submissions held in doubt until confirmed
//! - Ledger failures keep the order until the append succeeds

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upx_core::{
    AuditLedger, ClientOrderId, CoreError, ExchangeOrderStatus, LedgerEntry, LifecycleEvent,
    Lineage, MarketCode, MemoryLedger, MemoryNotifier, Order, OrderEvent, OrderKind, OrderRequest,
    OrderSide, OrderState, Price, Size, TradeFill,
};
use upx_orders::{
    pump_events, OrderConfig, OrderError, OrderStateMachine, TimeoutDecision, TimeoutMonitor,
    TimeoutPolicy,
};
use upx_rest::{MockGateway, RestError};

struct Harness {
    gateway: Arc<MockGateway>,
    notifier: Arc<MemoryNotifier>,
    ledger: Arc<MemoryLedger>,
    machine: OrderStateMachine,
}

fn harness(config: OrderConfig) -> Harness {
    let gateway = Arc::new(MockGateway::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let ledger = Arc::new(MemoryLedger::new());
    let machine =
        OrderStateMachine::new(config, gateway.clone(), notifier.clone(), ledger.clone());
    Harness {
        gateway,
        notifier,
        ledger,
        machine,
    }
}

struct FixedPolicy(TimeoutDecision);

impl TimeoutPolicy for FixedPolicy {
    fn decide(&self, _order: &Order) -> TimeoutDecision {
        self.0.clone()
    }
}

fn harness_with_policy(config: OrderConfig, decision: TimeoutDecision) -> Harness {
    let mut h = harness(config);
    h.machine = h.machine.with_policy(Arc::new(FixedPolicy(decision)));
    h
}

fn btc_bid() -> OrderRequest {
    OrderRequest::limit(
        MarketCode::new("KRW-BTC").unwrap(),
        OrderSide::Bid,
        Size::new(dec!(0.01)),
        Price::new(dec!(50000000)),
    )
}

fn xrp_bid(volume: Decimal) -> OrderRequest {
    OrderRequest::limit(
        MarketCode::new("KRW-XRP").unwrap(),
        OrderSide::Bid,
        Size::new(volume),
        Price::new(dec!(1000)),
    )
}

fn status(order: &Order, status: ExchangeOrderStatus) -> OrderEvent {
    OrderEvent::status_only(
        Some(order.identifier.clone()),
        order.exchange_uuid.clone(),
        status,
    )
}

fn cumulative(order: &Order, executed: Decimal, s: ExchangeOrderStatus) -> OrderEvent {
    let mut event = status(order, s);
    event.executed_volume = Some(Size::new(executed));
    event
}

fn trade(order: &Order, trade_id: &str, price: Decimal, volume: Decimal, total: Decimal) -> OrderEvent {
    let mut event = cumulative(order, total, ExchangeOrderStatus::Trade);
    event.trade = Some(TradeFill {
        trade_id: trade_id.to_string(),
        price: Price::new(price),
        volume: Size::new(volume),
    });
    event
}

/// Rewrite the exchange-side view of an order.
fn set_remote(gateway: &MockGateway, id: &ClientOrderId, f: impl FnOnce(&mut OrderEvent)) {
    let mut remote = gateway.order(id).unwrap();
    f(&mut remote);
    gateway.upsert_order(remote);
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submit_inserts_accepted_and_notifies() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    assert_eq!(order.state, OrderState::Accepted);
    assert_eq!(order.exchange_uuid.as_deref(), Some("mock-uuid-1"));
    assert!(order.identifier.as_str().starts_with("upx-"));
    assert_eq!(h.machine.live_orders().len(), 1);
    assert_eq!(
        h.machine.by_exchange_uuid("mock-uuid-1").unwrap().identifier,
        order.identifier
    );
    assert_eq!(h.notifier.count("submitted"), 1);
}

#[tokio::test]
async fn test_submit_below_minimum_never_reaches_exchange() {
    let h = harness(OrderConfig::default());
    let tiny = OrderRequest::limit(
        MarketCode::new("KRW-BTC").unwrap(),
        OrderSide::Bid,
        Size::new(dec!(0.00001)),
        Price::new(dec!(50000000)),
    );

    let err = h.machine.submit(tiny, None).await.unwrap_err();
    assert!(matches!(err, OrderError::Validation(_)));
    assert!(h.gateway.placed().is_empty());
    assert!(h.machine.live_orders().is_empty());
}

#[tokio::test]
async fn test_rejected_submission_is_not_tracked() {
    let h = harness(OrderConfig::default());
    h.gateway.fail_next_place(RestError::Validation {
        status: 400,
        name: "insufficient_funds_bid".into(),
        message: "not enough KRW".into(),
    });

    let err = h.machine.submit(btc_bid(), None).await.unwrap_err();
    assert!(matches!(err, OrderError::Rest(_)));
    assert!(h.machine.in_doubt().is_empty());
    assert!(h.gateway.lookups().is_empty());
    assert_eq!(h.notifier.count("submitted"), 0);
}

#[tokio::test]
async fn test_ambiguous_submission_held_in_doubt_until_stream_confirms() {
    let h = harness(OrderConfig::default());
    h.gateway.fail_next_place(RestError::TransientNetwork {
        endpoint: "place_order".into(),
        message: "timed out".into(),
        maybe_sent: true,
    });

    let err = h.machine.submit(btc_bid(), None).await.unwrap_err();
    let id = match err {
        OrderError::InDoubt(id) => id,
        other => panic!("expected InDoubt, got {other:?}"),
    };
    assert_eq!(h.gateway.lookups().len(), 1);
    assert_eq!(h.machine.in_doubt().len(), 1);
    assert!(h.machine.get(&id).is_none());

    let confirmation =
        OrderEvent::status_only(Some(id.clone()), Some("u-77".into()), ExchangeOrderStatus::Wait);
    let order = h.machine.apply_event(confirmation).unwrap();
    assert_eq!(order.state, OrderState::Accepted);
    assert_eq!(order.exchange_uuid.as_deref(), Some("u-77"));
    assert!(h.machine.in_doubt().is_empty());
    assert_eq!(h.notifier.count("submitted"), 1);
}

// ============================================================================
// Event folding
// ============================================================================

#[tokio::test]
async fn test_fill_with_duplicate_is_applied_once() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    let first = trade(&order, "t-1", dec!(50000000), dec!(0.004), dec!(0.004));
    let partial = h.machine.apply_event(first.clone()).unwrap();
    assert_eq!(partial.state, OrderState::PartiallyFilled);
    assert_eq!(partial.filled, Size::new(dec!(0.004)));

    let replay = h.machine.apply_event(first).unwrap();
    assert_eq!(replay.filled, Size::new(dec!(0.004)));

    let second = trade(&order, "t-2", dec!(50100000), dec!(0.006), dec!(0.01));
    let done = h.machine.apply_event(second.clone()).unwrap();
    assert_eq!(done.state, OrderState::Filled);
    assert_eq!(done.filled, Size::new(dec!(0.01)));
    assert_eq!(done.avg_fill_price, Some(Price::new(dec!(50060000))));

    // Late duplicates after eviction change nothing.
    assert!(h.machine.apply_event(second).is_none());
    assert!(h
        .machine
        .apply_event(status(&order, ExchangeOrderStatus::Done))
        .is_none());

    assert!(h.machine.get(&order.identifier).is_none());
    assert_eq!(h.notifier.count("filled"), 1);
    let entries = h.ledger.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, OrderState::Filled);
}

#[tokio::test]
async fn test_out_of_order_cumulative_fill_never_decreases() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    let mut newer = cumulative(&order, dec!(0.006), ExchangeOrderStatus::Trade);
    newer.avg_price = Some(Price::new(dec!(50000000)));
    h.machine.apply_event(newer);
    let after = h
        .machine
        .apply_event(cumulative(&order, dec!(0.004), ExchangeOrderStatus::Trade))
        .unwrap();
    assert_eq!(after.filled, Size::new(dec!(0.006)));
    assert_eq!(after.state, OrderState::PartiallyFilled);
    assert_eq!(after.avg_fill_price, Some(Price::new(dec!(50000000))));

    let cancelled = h
        .machine
        .apply_event(cumulative(&order, dec!(0.006), ExchangeOrderStatus::Cancel))
        .unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);

    let events = h.notifier.events();
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::Cancelled { filled, .. } if *filled == Size::new(dec!(0.006))
    )));
}

#[tokio::test]
async fn test_event_matched_by_exchange_uuid() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    let mut event = OrderEvent::status_only(
        None,
        Some("mock-uuid-1".into()),
        ExchangeOrderStatus::Trade,
    );
    event.executed_volume = Some(Size::new(dec!(0.002)));
    let updated = h.machine.apply_event(event).unwrap();
    assert_eq!(updated.identifier, order.identifier);
    assert_eq!(updated.filled, Size::new(dec!(0.002)));
}

#[tokio::test]
async fn test_overfill_is_clamped_with_diagnostic() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    let over = h
        .machine
        .apply_event(cumulative(&order, dec!(0.02), ExchangeOrderStatus::Trade))
        .unwrap();
    assert_eq!(over.filled, Size::new(dec!(0.01)));
    assert_eq!(over.state, OrderState::Filled);
    assert_eq!(over.diagnostics.len(), 1);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_timeout_then_cancel_finalizes_cancelled() {
    let h = harness_with_policy(OrderConfig::default(), TimeoutDecision::Cancel);
    let order = h.machine.submit(btc_bid(), None).await.unwrap();
    let id = order.identifier.clone();

    assert!(h.machine.check_timeouts(Utc::now()).is_empty());

    let later = Utc::now() + Duration::seconds(61);
    assert_eq!(h.machine.check_timeouts(later), vec![id.clone()]);
    assert_eq!(h.machine.get(&id).unwrap().state, OrderState::TimedOut);
    assert_eq!(h.notifier.count("timed_out"), 1);
    // Already timed out: not reported twice.
    assert!(h.machine.check_timeouts(later).is_empty());

    h.machine.resolve_timeouts(later).await;
    assert!(h.machine.get(&id).is_none());
    assert_eq!(h.gateway.cancels().len(), 1);
    assert_eq!(h.notifier.count("cancelled"), 1);
    assert_eq!(h.ledger.entries()[0].state, OrderState::Cancelled);
}

#[tokio::test]
async fn test_partially_filled_order_times_out_sooner() {
    let h = harness(OrderConfig::default());
    let partial = h.machine.submit(btc_bid(), None).await.unwrap();
    let idle = h.machine.submit(btc_bid(), None).await.unwrap();
    h.machine
        .apply_event(cumulative(&partial, dec!(0.004), ExchangeOrderStatus::Trade));

    let timed_out = h.machine.check_timeouts(Utc::now() + Duration::seconds(31));
    assert_eq!(timed_out, vec![partial.identifier.clone()]);
    assert_eq!(h.machine.get(&idle.identifier).unwrap().state, OrderState::Accepted);
}

#[tokio::test]
async fn test_timed_out_order_already_done_is_finalized_from_snapshot() {
    let h = harness_with_policy(OrderConfig::default(), TimeoutDecision::Cancel);
    let order = h.machine.submit(btc_bid(), None).await.unwrap();
    let id = order.identifier.clone();
    set_remote(&h.gateway, &id, |remote| {
        remote.status = ExchangeOrderStatus::Done;
        remote.executed_volume = Some(Size::new(dec!(0.01)));
        remote.remaining_volume = Some(Size::ZERO);
        remote.avg_price = Some(Price::new(dec!(50000000)));
    });

    let later = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(later);
    h.machine.resolve_timeouts(later).await;

    assert!(h.gateway.cancels().is_empty());
    assert_eq!(h.notifier.count("filled"), 1);
    assert_eq!(h.ledger.entries()[0].state, OrderState::Filled);
}

#[tokio::test]
async fn test_timed_out_order_missing_at_exchange_is_cancelled() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();
    h.gateway.remove_order(&order.identifier);

    let later = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(later);
    h.machine.resolve_timeouts(later).await;

    let entry = &h.ledger.entries()[0];
    assert_eq!(entry.state, OrderState::Cancelled);
    assert!(!entry.order.diagnostics.is_empty());
    assert_eq!(h.gateway.placed().len(), 1);
}

#[tokio::test]
async fn test_unfilled_timeout_retries_with_lineage() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();
    let id = order.identifier.clone();

    let later = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(later);
    h.machine.resolve_timeouts(later).await;

    let placed = h.gateway.placed();
    assert_eq!(placed.len(), 2);
    let (successor_id, successor_request) = &placed[1];
    assert_eq!(successor_id.as_str(), format!("{id}-r1"));
    assert_eq!(successor_request.volume, Some(Size::new(dec!(0.01))));

    let successor = h.machine.get(successor_id).unwrap();
    assert_eq!(successor.state, OrderState::Accepted);
    assert_eq!(successor.retry_count, 1);
    assert_eq!(
        successor.lineage,
        Some(Lineage {
            root: id.clone(),
            parent: id.clone(),
        })
    );

    assert!(h.machine.get(&id).is_none());
    assert_eq!(h.ledger.entries()[0].state, OrderState::Retried);
    assert_eq!(h.notifier.count("submitted"), 2);
    assert_eq!(h.gateway.cancels().len(), 1);
}

#[tokio::test]
async fn test_finished_lineage_releases_retry_bookkeeping() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(btc_bid(), None).await.unwrap();

    let later = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(later);
    h.machine.resolve_timeouts(later).await;
    assert_eq!(h.machine.tracked_lineages(), 1);

    let successor_id = h.gateway.placed()[1].0.clone();
    let successor = h.machine.get(&successor_id).unwrap();
    assert_eq!(successor.lineage.as_ref().map(|l| &l.root), Some(&order.identifier));
    h.machine
        .apply_event(cumulative(&successor, dec!(0.01), ExchangeOrderStatus::Done))
        .unwrap();

    assert!(h.machine.get(&successor_id).is_none());
    assert_eq!(h.machine.tracked_lineages(), 0);
}

#[tokio::test]
async fn test_partial_fill_timeout_amends_to_reduced_remainder() {
    let h = harness(OrderConfig::default());
    let order = h.machine.submit(xrp_bid(dec!(100)), None).await.unwrap();
    let id = order.identifier.clone();
    set_remote(&h.gateway, &id, |remote| {
        remote.executed_volume = Some(Size::new(dec!(40)));
        remote.remaining_volume = Some(Size::new(dec!(60)));
    });

    let later = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(later);
    h.machine.resolve_timeouts(later).await;

    let placed = h.gateway.placed();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[1].1.volume, Some(Size::new(dec!(30))));
    assert_eq!(placed[1].1.kind, OrderKind::Limit);

    let retired = &h.ledger.entries()[0];
    assert_eq!(retired.state, OrderState::Retried);
    assert_eq!(retired.order.filled, Size::new(dec!(40)));
}

#[tokio::test]
async fn test_cooldown_then_exhaustion_escalates() {
    let config = OrderConfig {
        max_retries: 1,
        retry_cooldown_secs: 30,
        ..OrderConfig::default()
    };
    let h = harness(config);
    let order = h.machine.submit(btc_bid(), None).await.unwrap();
    let root = order.identifier.clone();

    let t1 = Utc::now() + Duration::seconds(61);
    h.machine.check_timeouts(t1);
    h.machine.resolve_timeouts(t1).await;
    let successor_id = ClientOrderId::retry_of(&root, 1);
    assert_eq!(h.machine.get(&successor_id).unwrap().retry_count, 1);

    // The successor times out inside the cooldown window: nothing happens.
    let t2 = t1 + Duration::seconds(10);
    assert_eq!(h.machine.check_timeouts(t2), vec![successor_id.clone()]);
    h.machine.resolve_timeouts(t2).await;
    assert_eq!(h.machine.get(&successor_id).unwrap().state, OrderState::TimedOut);
    assert_eq!(h.gateway.cancels().len(), 1);

    // After the cooldown the retry budget is spent.
    let t3 = t1 + Duration::seconds(31);
    h.machine.resolve_timeouts(t3).await;
    let escalated = h.machine.get(&successor_id).unwrap();
    assert_eq!(escalated.state, OrderState::Escalated);
    assert_eq!(h.notifier.count("escalated"), 1);
    assert_eq!(h.gateway.cancels().len(), 1);
    assert_eq!(h.gateway.placed().len(), 2);

    // Escalated orders stay parked.
    h.machine.resolve_timeouts(t3 + Duration::seconds(300)).await;
    assert!(h
        .machine
        .live_orders()
        .iter()
        .any(|o| o.identifier == successor_id && o.state == OrderState::Escalated));
}

// ============================================================================
// Ledger and adoption
// ============================================================================

#[derive(Default)]
struct FlakyLedger {
    healthy: AtomicBool,
    appended: AtomicUsize,
}

impl AuditLedger for FlakyLedger {
    fn append(&self, _entry: &LedgerEntry) -> upx_core::Result<()> {
        if !self.healthy.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Ledger("disk full".into()));
        }
        self.appended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_ledger_append_keeps_order_until_flushed() {
    let gateway = Arc::new(MockGateway::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let ledger = Arc::new(FlakyLedger::default());
    let machine = OrderStateMachine::new(
        OrderConfig::default(),
        gateway.clone(),
        notifier.clone(),
        ledger.clone(),
    );

    let order = machine.submit(btc_bid(), None).await.unwrap();
    machine.apply_event(cumulative(&order, dec!(0.01), ExchangeOrderStatus::Done));

    assert_eq!(notifier.count("persistent_failure"), 1);
    assert_eq!(machine.get(&order.identifier).unwrap().state, OrderState::Filled);
    assert!(machine.live_orders().is_empty());

    assert_eq!(machine.flush_finalized(), 1);
    assert!(machine.get(&order.identifier).is_none());
    assert_eq!(ledger.appended.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.count("filled"), 1);
}

#[tokio::test]
async fn test_adopt_is_idempotent() {
    let h = harness(OrderConfig::default());
    let mut remote = OrderEvent::status_only(
        Some(ClientOrderId::from_string("manual-1")),
        Some("u-ext".into()),
        ExchangeOrderStatus::Wait,
    );
    remote.market = Some(MarketCode::new("KRW-ETH").unwrap());
    remote.side = Some(OrderSide::Ask);
    remote.kind = Some(OrderKind::Limit);
    remote.price = Some(Price::new(dec!(3000000)));
    remote.volume = Some(Size::new(dec!(0.5)));
    remote.executed_volume = Some(Size::new(dec!(0.1)));

    let adopted = h.machine.adopt(&remote).unwrap();
    assert!(adopted.externally_adopted);
    assert_eq!(adopted.state, OrderState::PartiallyFilled);
    assert_eq!(adopted.requested_volume, Some(Size::new(dec!(0.5))));

    assert!(h.machine.adopt(&remote).is_none());
    assert_eq!(h.notifier.count("adopted_externally"), 1);
    assert_eq!(h.machine.live_orders().len(), 1);
}

// ============================================================================
// Background tasks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_monitor_resolves_idle_orders() {
    let config = OrderConfig {
        order_timeout_secs: 0,
        ..OrderConfig::default()
    };
    let h = harness_with_policy(config, TimeoutDecision::Cancel);
    let machine = Arc::new(h.machine);
    let order = machine.submit(btc_bid(), None).await.unwrap();

    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(TimeoutMonitor::new(machine.clone(), shutdown.clone()).run());
    tokio::time::sleep(StdDuration::from_millis(1500)).await;
    shutdown.cancel();
    monitor.await.unwrap();

    assert!(machine.get(&order.identifier).is_none());
    assert_eq!(h.notifier.count("timed_out"), 1);
    assert_eq!(h.notifier.count("cancelled"), 1);
}

#[tokio::test]
async fn test_pump_applies_stream_events() {
    let h = harness(OrderConfig::default());
    let machine = Arc::new(h.machine);
    let order = machine.submit(btc_bid(), None).await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    tx.send(cumulative(&order, dec!(0.003), ExchangeOrderStatus::Trade))
        .await
        .unwrap();
    drop(tx);
    pump_events(machine.clone(), rx, CancellationToken::new()).await;

    let updated = machine.get(&order.identifier).unwrap();
    assert_eq!(updated.filled, Size::new(dec!(0.003)));
    assert_eq!(updated.state, OrderState::PartiallyFilled);
}
