//! Main application orchestration.
//!
//! Wires the four components together:
//! - Request pipeline and exchange client (the gateway)
//! - Private stream (`myOrder`, `myAsset`) and optional public stream
//! - Order state machine with its timeout monitor
//! - Reconciliation loop, triggered early by stream gaps

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use upx_core::{DynLedger, DynNotifier};
use upx_orders::{pump_events, OrderStateMachine, TimeoutMonitor};
use upx_recon::{pump_assets, Portfolio, Reconciler};
use upx_rest::{
    DynGateway, DynHttpTransport, ExchangeClient, JwtSigner, ReqwestTransport, RestPipeline,
};
use upx_ws::{
    Authorizer, Connector, Dispatcher, StreamClient, StreamFrame, StreamHandle,
    TungsteniteConnector, WsError,
};

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::ledger::JsonlLedger;
use crate::notifier::LogNotifier;

/// How long `stop` waits for each task before aborting it.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// External collaborators of the engine.
pub struct Collaborators {
    pub gateway: DynGateway,
    pub connector: Arc<dyn Connector>,
    pub authorizer: Option<Authorizer>,
    pub notifier: DynNotifier,
    pub ledger: DynLedger,
}

/// Running engine: shared components plus the background tasks.
pub struct Engine {
    pub machine: Arc<OrderStateMachine>,
    pub portfolio: Arc<Portfolio>,
    pub reconciler: Arc<Reconciler>,
    pub private_stream: StreamHandle,
    pub public_stream: Option<StreamHandle>,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Engine {
    /// Build every component and spawn the background tasks.
    pub fn start(
        config: &AppConfig,
        parts: Collaborators,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        let Collaborators {
            gateway,
            connector,
            authorizer,
            notifier,
            ledger,
        } = parts;

        let machine = Arc::new(OrderStateMachine::new(
            config.orders.clone(),
            gateway.clone(),
            notifier.clone(),
            ledger,
        ));
        let portfolio = Arc::new(Portfolio::new());
        let reconciler = Arc::new(Reconciler::new(
            config.recon.clone(),
            machine.clone(),
            gateway,
            notifier,
            portfolio.clone(),
        ));

        let capacity = config.stream.channel_capacity;
        let (orders_tx, orders_rx) = mpsc::channel(capacity);
        let (assets_tx, assets_rx) = mpsc::channel(capacity);

        let private = Arc::new(StreamClient::new(
            config.stream.client_config(&config.stream.private_url),
            connector.clone(),
            Dispatcher::new().with_orders(orders_tx).with_assets(assets_tx),
            authorizer,
        ));
        let private_stream = private.handle();
        for subscription in config.stream.private_subscriptions() {
            private_stream.subscribe(subscription)?;
        }
        let stream_events = private_stream.events();

        let mut tasks = Vec::new();
        tasks.push(("private_stream", spawn_stream(private)));
        tasks.push((
            "order_events",
            tokio::spawn(pump_events(machine.clone(), orders_rx, shutdown.clone())),
        ));
        tasks.push((
            "asset_snapshots",
            tokio::spawn(pump_assets(portfolio.clone(), assets_rx, shutdown.clone())),
        ));
        tasks.push((
            "timeout_monitor",
            tokio::spawn(TimeoutMonitor::new(machine.clone(), shutdown.clone()).run()),
        ));
        tasks.push((
            "reconciliation",
            tokio::spawn(
                reconciler
                    .clone()
                    .run(Some(stream_events), shutdown.clone()),
            ),
        ));

        let subscriptions = config.stream.public_subscriptions()?;
        let public_stream = if subscriptions.is_empty() {
            None
        } else {
            let (market_tx, market_rx) = mpsc::channel(capacity);
            let public = Arc::new(StreamClient::new(
                config.stream.client_config(&config.stream.public_url),
                connector,
                Dispatcher::new().with_market(market_tx),
                None,
            ));
            let handle = public.handle();
            for subscription in subscriptions {
                handle.subscribe(subscription)?;
            }
            tasks.push(("public_stream", spawn_stream(public)));
            tasks.push((
                "market_data",
                tokio::spawn(drain_market(market_rx, shutdown.clone())),
            ));
            Some(handle)
        };

        info!(tasks = tasks.len(), "Engine started");
        Ok(Self {
            machine,
            portfolio,
            reconciler,
            private_stream,
            public_stream,
            shutdown,
            tasks,
        })
    }

    /// Cancel every task and wait for them to finish.
    pub async fn stop(self) {
        info!("Stopping engine");
        self.shutdown.cancel();
        self.private_stream.shutdown();
        if let Some(public) = &self.public_stream {
            public.shutdown();
        }

        for (name, mut task) in self.tasks {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let flushed = self.machine.flush_finalized();
        let live = self.machine.live_orders().len();
        info!(flushed, live, "Engine stopped");
    }
}

fn spawn_stream(client: Arc<StreamClient>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = client.run().await {
            error!(error = %e, "Stream client failed");
        }
    })
}

/// Market data has no consumer inside the engine; frames are traced.
async fn drain_market(mut frames: mpsc::Receiver<StreamFrame>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => trace!(kind = frame.kind(), "Market frame"),
                None => break,
            },
        }
    }
}

/// Main application.
pub struct Application {
    config: AppConfig,
    shutdown: CancellationToken,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops `run` when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Production collaborators: REST over reqwest, stream over tungstenite,
    /// log notifier and JSONL ledger.
    fn collaborators(&self) -> AppResult<Collaborators> {
        let credentials = self.config.credentials()?;
        info!(access_key = credentials.access_key(), "Credentials loaded");

        let transport: DynHttpTransport =
            Arc::new(ReqwestTransport::new(self.config.rest.base_url.clone())?);
        let pipeline = Arc::new(RestPipeline::new(
            transport,
            Some(JwtSigner::new(credentials)),
            self.config.rest.throttle.clone(),
        ));

        let stream_pipeline = pipeline.clone();
        let authorizer: Authorizer = Arc::new(move || {
            stream_pipeline
                .stream_authorization()
                .map_err(|e| WsError::ConnectionFailed(format!("authorization: {e}")))
        });

        Ok(Collaborators {
            gateway: Arc::new(ExchangeClient::new(pipeline)),
            connector: Arc::new(TungsteniteConnector::new()),
            authorizer: Some(authorizer),
            notifier: Arc::new(LogNotifier::new()),
            ledger: Arc::new(JsonlLedger::open(&self.config.ledger.path)?),
        })
    }

    /// Run until Ctrl-C or the shutdown token is cancelled.
    pub async fn run(self) -> AppResult<()> {
        let parts = self.collaborators()?;
        let engine = Engine::start(&self.config, parts, self.shutdown.clone())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        engine.stop().await;
        Ok(())
    }
}
