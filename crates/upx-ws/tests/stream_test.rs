//! Streaming client integration tests.
//!
//! Drives `StreamClient` over `ChannelConnector` with a paused clock:
//! - Idle detection, reconnect and verbatim subscription replay
//! - Backoff on connect failures and shutdown during backoff
//! - Live subscribe, unsubscribe by recycle
//! - Frame dispatch for both encodings, and the gap signal on a dropped frame

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use upx_core::{ClientOrderId, ExchangeOrderStatus, MarketCode};
use upx_ws::{
    Authorizer, Channel, ChannelConnector, Dispatcher, Encoding, Message, StreamClient,
    StreamConfig, StreamEvent, StreamHandle, StreamState, Subscription, WsError, WsResult,
};

fn market(code: &str) -> MarketCode {
    MarketCode::new(code).unwrap()
}

fn spawn(client: &Arc<StreamClient>) -> JoinHandle<WsResult<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.run().await })
}

async fn wait_for(handle: &StreamHandle, state: StreamState) {
    let mut rx = handle.state_watch();
    rx.wait_for(|s| *s == state).await.unwrap();
}

fn public_client(connector: Arc<ChannelConnector>) -> Arc<StreamClient> {
    Arc::new(StreamClient::new(
        StreamConfig::default(),
        connector,
        Dispatcher::new(),
        None,
    ))
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_reconnects_and_replays_identical_subscriptions() {
    let (connector, mut sessions) = ChannelConnector::new();
    let client = public_client(Arc::new(connector));
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::Ticker, [market("KRW-BTC")], Encoding::Simple))
        .unwrap();
    handle
        .subscribe(Subscription::new(Channel::Trade, [market("KRW-ETH")], Encoding::Default))
        .unwrap();
    let mut events = handle.events();
    let runner = spawn(&client);

    let mut first = sessions.recv().await.unwrap();
    let first_replay = vec![
        first.next_text().await.unwrap(),
        first.next_text().await.unwrap(),
    ];
    wait_for(&handle, StreamState::Live).await;
    let start = Instant::now();

    // The server stays connected but silent; `first` is kept alive.
    let mut second = sessions.recv().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(120), "reconnected after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(125), "reconnected after {elapsed:?}");

    let second_replay = vec![
        second.next_text().await.unwrap(),
        second.next_text().await.unwrap(),
    ];
    assert_eq!(first_replay, second_replay);

    // Pings went out every 30s before the idle close.
    let mut pings = 0;
    let mut closed = false;
    while let Ok(message) = first.sent.try_recv() {
        match message {
            Message::Ping(_) => pings += 1,
            Message::Close(_) => closed = true,
            _ => {}
        }
    }
    assert_eq!(pings, 3);
    assert!(closed);

    assert_eq!(
        events.recv().await.unwrap(),
        StreamEvent::Resynced { reconnects: 1 }
    );

    handle.shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(handle.state(), StreamState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frames_keep_connection_alive() {
    let (connector, mut sessions) = ChannelConnector::new();
    let connector = Arc::new(connector);
    let client = public_client(connector.clone());
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::Ticker, [market("KRW-BTC")], Encoding::Simple))
        .unwrap();
    let runner = spawn(&client);

    let session = sessions.recv().await.unwrap();
    wait_for(&handle, StreamState::Live).await;

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(session.push_text(r#"{"status":"UP"}"#));
    }
    // 500s with a frame every 100s: still on the first connection.
    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.state(), StreamState::Live);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_back_off_then_connect() {
    let (connector, mut sessions) = ChannelConnector::new();
    let connector = Arc::new(connector);
    connector.fail_next(2);
    let client = public_client(connector.clone());
    let handle = client.handle();

    let start = Instant::now();
    let runner = spawn(&client);
    let _session = sessions.recv().await.unwrap();

    // 1s + 2s of backoff, plus under 1s of jitter each.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(connector.attempts(), 3);

    wait_for(&handle, StreamState::Live).await;
    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff() {
    let (connector, _sessions) = ChannelConnector::new();
    let connector = Arc::new(connector);
    connector.fail_next(u32::MAX);
    let client = public_client(connector.clone());
    let handle = client.handle();
    let runner = spawn(&client);

    wait_for(&handle, StreamState::Reconnecting).await;
    handle.shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(handle.state(), StreamState::Disconnected);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects_and_signals_gap() {
    let (connector, mut sessions) = ChannelConnector::new();
    let client = public_client(Arc::new(connector));
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::Orderbook, [market("KRW-BTC")], Encoding::Simple))
        .unwrap();
    let mut events = handle.events();
    let runner = spawn(&client);

    let mut first = sessions.recv().await.unwrap();
    let payload = first.next_text().await.unwrap();
    wait_for(&handle, StreamState::Live).await;

    first.incoming.send(Ok(Message::Close(None))).unwrap();

    let mut second = sessions.recv().await.unwrap();
    assert_eq!(second.next_text().await.unwrap(), payload);
    assert!(matches!(
        events.recv().await.unwrap(),
        StreamEvent::Resynced { .. }
    ));
    assert_eq!(handle.reconnect_count(), 1);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_live_sends_immediately() {
    let (connector, mut sessions) = ChannelConnector::new();
    let client = public_client(Arc::new(connector));
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::Ticker, [market("KRW-BTC")], Encoding::Simple))
        .unwrap();
    let runner = spawn(&client);

    let mut session = sessions.recv().await.unwrap();
    session.next_text().await.unwrap();
    wait_for(&handle, StreamState::Live).await;

    let trade = Subscription::new(Channel::Trade, [market("KRW-BTC")], Encoding::Simple);
    assert!(handle.subscribe(trade.clone()).unwrap());
    assert!(!handle.subscribe(trade).unwrap());

    let sent: serde_json::Value =
        serde_json::from_str(&session.next_text().await.unwrap()).unwrap();
    assert_eq!(sent[1]["type"], "trade");
    assert_eq!(handle.subscriptions().len(), 2);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_recycles_with_remaining_set() {
    let (connector, mut sessions) = ChannelConnector::new();
    let client = public_client(Arc::new(connector));
    let handle = client.handle();
    let ticker = Subscription::new(Channel::Ticker, [market("KRW-BTC")], Encoding::Simple);
    let trade = Subscription::new(Channel::Trade, [market("KRW-BTC")], Encoding::Simple);
    handle.subscribe(ticker).unwrap();
    handle.subscribe(trade.clone()).unwrap();
    let runner = spawn(&client);

    let mut first = sessions.recv().await.unwrap();
    let ticker_payload = first.next_text().await.unwrap();
    first.next_text().await.unwrap();
    wait_for(&handle, StreamState::Live).await;

    let start = Instant::now();
    assert!(handle.unsubscribe(&trade));
    let mut second = sessions.recv().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    assert_eq!(second.next_text().await.unwrap(), ticker_payload);
    wait_for(&handle, StreamState::Live).await;
    assert!(second.sent.try_recv().is_err());

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_private_frames_dispatched_in_both_encodings() {
    let (connector, mut sessions) = ChannelConnector::new();
    let (orders_tx, mut orders_rx) = mpsc::channel(16);
    let (assets_tx, mut assets_rx) = mpsc::channel(16);
    let authorizer: Authorizer = Arc::new(|| Ok::<_, WsError>("Bearer test-token".to_string()));
    let client = Arc::new(StreamClient::new(
        StreamConfig {
            url: upx_ws::PRIVATE_URL.to_string(),
            ..StreamConfig::default()
        },
        Arc::new(connector),
        Dispatcher::new().with_orders(orders_tx).with_assets(assets_tx),
        Some(authorizer),
    ));
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::MyOrder, [], Encoding::Simple))
        .unwrap();
    handle
        .subscribe(Subscription::new(Channel::MyAsset, [], Encoding::Default))
        .unwrap();
    let runner = spawn(&client);

    let session = sessions.recv().await.unwrap();
    assert_eq!(session.authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(session.url, upx_ws::PRIVATE_URL);
    wait_for(&handle, StreamState::Live).await;

    assert!(session.push_text(
        r#"{"ty":"myOrder","cd":"KRW-BTC","uid":"u-1","ab":"BID","ot":"limit","s":"wait",
        "p":"50000000","v":"0.01","rv":"0.01","ev":"0","id":"upx-1-1","otms":1700000000000}"#
    ));
    assert!(session.push_binary(
        br#"{"type":"myAsset","assets":[{"currency":"KRW","balance":"500000","locked":"500000"}],
        "asset_timestamp":1700000000000}"#
            .to_vec()
    ));
    assert!(session.push_text("not json"));
    assert!(session.push_text(
        r#"{"type":"myOrder","code":"KRW-BTC","uuid":"u-1","ask_bid":"BID","order_type":"limit",
        "state":"cancel","price":"50000000","volume":"0.01","remaining_volume":"0.01",
        "executed_volume":"0","identifier":"upx-1-1"}"#
    ));

    let wait = orders_rx.recv().await.unwrap();
    assert_eq!(wait.identifier, Some(ClientOrderId::from_string("upx-1-1")));
    assert_eq!(wait.status, ExchangeOrderStatus::Wait);
    let cancel = orders_rx.recv().await.unwrap();
    assert_eq!(cancel.status, ExchangeOrderStatus::Cancel);

    let snapshot = assets_rx.recv().await.unwrap();
    assert_eq!(snapshot.assets[0].currency, "KRW");
    // A malformed frame does not drop the connection.
    assert_eq!(handle.state(), StreamState::Live);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dropped_account_frame_signals_gap_without_reconnect() {
    let (connector, mut sessions) = ChannelConnector::new();
    let connector = Arc::new(connector);
    let (orders_tx, mut orders_rx) = mpsc::channel(1);
    let authorizer: Authorizer = Arc::new(|| Ok::<_, WsError>("Bearer test-token".to_string()));
    let client = Arc::new(StreamClient::new(
        StreamConfig {
            url: upx_ws::PRIVATE_URL.to_string(),
            ..StreamConfig::default()
        },
        connector.clone(),
        Dispatcher::new().with_orders(orders_tx),
        Some(authorizer),
    ));
    let handle = client.handle();
    handle
        .subscribe(Subscription::new(Channel::MyOrder, [], Encoding::Simple))
        .unwrap();
    let mut events = handle.events();
    let runner = spawn(&client);

    let session = sessions.recv().await.unwrap();
    wait_for(&handle, StreamState::Live).await;

    for executed in ["0.004", "0.01"] {
        assert!(session.push_text(format!(
            r#"{{"ty":"myOrder","cd":"KRW-BTC","uid":"u-1","ab":"BID","ot":"limit","s":"trade",
            "p":"50000000","v":"0.01","ev":"{executed}","id":"upx-1-1"}}"#
        )));
    }

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("gap signalled")
        .unwrap();
    assert_eq!(event, StreamEvent::FramesDropped { kind: "my_order" });

    let delivered = orders_rx.recv().await.unwrap();
    assert_eq!(delivered.identifier, Some(ClientOrderId::from_string("upx-1-1")));
    assert!(orders_rx.try_recv().is_err());
    assert_eq!(handle.state(), StreamState::Live);
    assert_eq!(connector.attempts(), 1);

    handle.shutdown();
    runner.await.unwrap().unwrap();
}
