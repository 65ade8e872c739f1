//! Engine wiring tests.
//!
//! Starts the full engine over `MockGateway` and `ChannelConnector`:
//! - Bootstrap reconciliation adopts resting exchange orders
//! - Private stream frames reach the state machine and the portfolio
//! - Shipped configuration file parses and validates

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use upx_bot::{AppConfig, Collaborators, Engine};
use upx_core::{
    ClientOrderId, ExchangeOrderStatus, MarketCode, MemoryLedger, MemoryNotifier, OrderEvent,
    OrderKind, OrderRequest, OrderSide, OrderState, Price, Size,
};
use upx_rest::MockGateway;
use upx_ws::{Authorizer, ChannelConnector, StreamState, WsError};

fn external_order() -> OrderEvent {
    let mut event = OrderEvent::status_only(
        Some(ClientOrderId::from_string("manual-1")),
        Some("u-ext-1".to_string()),
        ExchangeOrderStatus::Wait,
    );
    event.market = Some(MarketCode::new("KRW-ETH").unwrap());
    event.side = Some(OrderSide::Ask);
    event.kind = Some(OrderKind::Limit);
    event.price = Some(Price::new(dec!(3000000)));
    event.volume = Some(Size::new(dec!(0.5)));
    event.remaining_volume = Some(Size::new(dec!(0.5)));
    event.executed_volume = Some(Size::ZERO);
    event
}

#[tokio::test(start_paused = true)]
async fn test_engine_routes_stream_and_reconciles() {
    let gateway = Arc::new(MockGateway::new());
    gateway.upsert_order(external_order());
    let notifier = Arc::new(MemoryNotifier::new());
    let ledger = Arc::new(MemoryLedger::new());
    let (connector, mut sessions) = ChannelConnector::new();
    let authorizer: Authorizer = Arc::new(|| Ok::<_, WsError>("Bearer test-token".to_string()));

    let shutdown = CancellationToken::new();
    let engine = Engine::start(
        &AppConfig::default(),
        Collaborators {
            gateway: gateway.clone(),
            connector: Arc::new(connector),
            authorizer: Some(authorizer),
            notifier: notifier.clone(),
            ledger: ledger.clone(),
        },
        shutdown.clone(),
    )
    .unwrap();
    assert!(engine.public_stream.is_none());

    let mut session = sessions.recv().await.unwrap();
    assert_eq!(session.authorization.as_deref(), Some("Bearer test-token"));
    let subscribe: serde_json::Value =
        serde_json::from_str(&session.next_text().await.unwrap()).unwrap();
    assert_eq!(subscribe[1]["type"], "myOrder");
    engine
        .private_stream
        .state_watch()
        .wait_for(|s| *s == StreamState::Live)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(notifier.count("adopted_externally"), 1);

    let order = engine
        .machine
        .submit(
            OrderRequest::limit(
                MarketCode::new("KRW-BTC").unwrap(),
                OrderSide::Bid,
                Size::new(dec!(0.01)),
                Price::new(dec!(50000000)),
            ),
            None,
        )
        .await
        .unwrap();

    assert!(session.push_text(&format!(
        r#"{{"ty":"myOrder","cd":"KRW-BTC","uid":"mock-uuid-1","ab":"BID","ot":"limit","s":"done",
        "p":"50000000","v":"0.01","rv":"0","ev":"0.01","id":"{}"}}"#,
        order.identifier
    )));
    assert!(session.push_text(
        r#"{"type":"myAsset","assets":[{"currency":"KRW","balance":"500000","locked":"0"}]}"#
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entries = ledger.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].identifier, order.identifier);
    assert_eq!(entries[0].state, OrderState::Filled);
    assert!(engine.machine.get(&order.identifier).is_none());
    assert_eq!(engine.portfolio.get("KRW").unwrap().balance, dec!(500000));

    engine.stop().await;
    assert!(shutdown.is_cancelled());
}

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/default.toml");
    let config = AppConfig::from_file(path).unwrap();
    assert_eq!(config.orders, upx_orders::OrderConfig::default());
    assert_eq!(config.recon, upx_recon::ReconConfig::default());
}
