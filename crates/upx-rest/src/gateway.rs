//! Exchange gateway seam.
//!
//! The order state machine and the reconciliation loop only see this trait,
//! so both can be driven by `MockGateway` in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use upx_core::{AssetBalance, ClientOrderId, ExchangeOrderStatus, OrderEvent, OrderRequest};

use crate::client::{ExchangeClient, OrderLookup};
use crate::error::{RestError, RestResult};
use crate::nonce::Clock;
use crate::transport::BoxFuture;

/// Order and account operations against the exchange.
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order. Success means the exchange received it.
    fn place_order<'a>(
        &'a self,
        identifier: &'a ClientOrderId,
        request: &'a OrderRequest,
    ) -> BoxFuture<'a, RestResult<OrderEvent>>;

    /// Cancel an order; returns the exchange's view right after the cancel.
    fn cancel_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<OrderEvent>>;

    /// Fetch one order. `Ok(None)` when the exchange does not know it.
    fn get_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<Option<OrderEvent>>>;

    /// Every open order of the account.
    fn open_orders(&self) -> BoxFuture<'_, RestResult<Vec<OrderEvent>>>;

    /// Every balance of the account.
    fn accounts(&self) -> BoxFuture<'_, RestResult<Vec<AssetBalance>>>;
}

/// Arc wrapper for ExchangeGateway trait objects.
pub type DynGateway = Arc<dyn ExchangeGateway>;

impl<C: Clock + 'static> ExchangeGateway for ExchangeClient<C> {
    fn place_order<'a>(
        &'a self,
        identifier: &'a ClientOrderId,
        request: &'a OrderRequest,
    ) -> BoxFuture<'a, RestResult<OrderEvent>> {
        Box::pin(ExchangeClient::place_order(self, identifier, request))
    }

    fn cancel_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<OrderEvent>> {
        Box::pin(async move { ExchangeClient::cancel_order(self, &lookup).await })
    }

    fn get_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<Option<OrderEvent>>> {
        Box::pin(async move { ExchangeClient::get_order(self, &lookup).await })
    }

    fn open_orders(&self) -> BoxFuture<'_, RestResult<Vec<OrderEvent>>> {
        Box::pin(ExchangeClient::open_orders(self))
    }

    fn accounts(&self) -> BoxFuture<'_, RestResult<Vec<AssetBalance>>> {
        Box::pin(ExchangeClient::accounts(self))
    }
}

// ============================================================================
// Mock gateway
// ============================================================================

/// In-memory exchange for tests.
///
/// Placed orders are stored as resting (`wait`) and served back by
/// `get_order`/`open_orders`; cancels flip them to `cancel`. Scripted
/// failures take precedence over the default behaviour.
#[derive(Default)]
pub struct MockGateway {
    orders: Mutex<Vec<OrderEvent>>,
    accounts: Mutex<Vec<AssetBalance>>,
    place_failures: Mutex<VecDeque<RestError>>,
    cancel_failures: Mutex<VecDeque<RestError>>,
    get_failures: Mutex<VecDeque<RestError>>,
    open_orders_failures: Mutex<VecDeque<RestError>>,
    placed: Mutex<Vec<(ClientOrderId, OrderRequest)>>,
    cancels: Mutex<Vec<OrderLookup>>,
    lookups: Mutex<Vec<OrderLookup>>,
    uuid_seq: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the exchange-side view of an order.
    pub fn upsert_order(&self, event: OrderEvent) {
        let mut orders = self.orders.lock();
        match orders.iter_mut().find(|o| same_order(o, &event)) {
            Some(existing) => *existing = event,
            None => orders.push(event),
        }
    }

    /// Forget an order entirely (the exchange returns 404 for it).
    pub fn remove_order(&self, identifier: &ClientOrderId) {
        self.orders
            .lock()
            .retain(|o| o.identifier.as_ref() != Some(identifier));
    }

    /// Exchange-side view of an order.
    pub fn order(&self, identifier: &ClientOrderId) -> Option<OrderEvent> {
        self.orders
            .lock()
            .iter()
            .find(|o| o.identifier.as_ref() == Some(identifier))
            .cloned()
    }

    pub fn set_accounts(&self, accounts: Vec<AssetBalance>) {
        *self.accounts.lock() = accounts;
    }

    pub fn fail_next_place(&self, error: RestError) {
        self.place_failures.lock().push_back(error);
    }

    pub fn fail_next_cancel(&self, error: RestError) {
        self.cancel_failures.lock().push_back(error);
    }

    pub fn fail_next_get(&self, error: RestError) {
        self.get_failures.lock().push_back(error);
    }

    pub fn fail_next_open_orders(&self, error: RestError) {
        self.open_orders_failures.lock().push_back(error);
    }

    pub fn placed(&self) -> Vec<(ClientOrderId, OrderRequest)> {
        self.placed.lock().clone()
    }

    pub fn cancels(&self) -> Vec<OrderLookup> {
        self.cancels.lock().clone()
    }

    pub fn lookups(&self) -> Vec<OrderLookup> {
        self.lookups.lock().clone()
    }

    fn find(&self, lookup: &OrderLookup) -> Option<OrderEvent> {
        self.orders
            .lock()
            .iter()
            .find(|o| matches_lookup(o, lookup))
            .cloned()
    }
}

fn matches_lookup(order: &OrderEvent, lookup: &OrderLookup) -> bool {
    match lookup {
        OrderLookup::Uuid(uuid) => order.exchange_uuid.as_deref() == Some(uuid.as_str()),
        OrderLookup::Identifier(id) => order.identifier.as_ref() == Some(id),
    }
}

fn same_order(a: &OrderEvent, b: &OrderEvent) -> bool {
    (a.exchange_uuid.is_some() && a.exchange_uuid == b.exchange_uuid)
        || (a.identifier.is_some() && a.identifier == b.identifier)
}

fn not_found() -> RestError {
    RestError::Validation {
        status: 404,
        name: "order_not_found".to_string(),
        message: "order not found".to_string(),
    }
}

impl ExchangeGateway for MockGateway {
    fn place_order<'a>(
        &'a self,
        identifier: &'a ClientOrderId,
        request: &'a OrderRequest,
    ) -> BoxFuture<'a, RestResult<OrderEvent>> {
        Box::pin(async move {
            self.placed.lock().push((identifier.clone(), request.clone()));
            if let Some(error) = self.place_failures.lock().pop_front() {
                return Err(error);
            }

            let seq = self.uuid_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let mut event = OrderEvent::status_only(
                Some(identifier.clone()),
                Some(format!("mock-uuid-{seq}")),
                ExchangeOrderStatus::Wait,
            );
            event.market = Some(request.market.clone());
            event.side = Some(request.side);
            event.kind = Some(request.kind);
            event.price = request.price;
            event.volume = request.volume;
            event.remaining_volume = request.volume;
            event.executed_volume = Some(upx_core::Size::ZERO);

            self.upsert_order(event.clone());
            Ok(event)
        })
    }

    fn cancel_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<OrderEvent>> {
        Box::pin(async move {
            self.cancels.lock().push(lookup.clone());
            if let Some(error) = self.cancel_failures.lock().pop_front() {
                return Err(error);
            }

            let mut orders = self.orders.lock();
            let order = orders
                .iter_mut()
                .find(|o| matches_lookup(o, &lookup))
                .ok_or_else(not_found)?;
            if order.status.is_final() {
                return Err(RestError::Validation {
                    status: 400,
                    name: "canceled_order".to_string(),
                    message: "order already finished".to_string(),
                });
            }
            order.status = ExchangeOrderStatus::Cancel;
            Ok(order.clone())
        })
    }

    fn get_order(&self, lookup: OrderLookup) -> BoxFuture<'_, RestResult<Option<OrderEvent>>> {
        Box::pin(async move {
            self.lookups.lock().push(lookup.clone());
            if let Some(error) = self.get_failures.lock().pop_front() {
                return Err(error);
            }
            Ok(self.find(&lookup))
        })
    }

    fn open_orders(&self) -> BoxFuture<'_, RestResult<Vec<OrderEvent>>> {
        Box::pin(async move {
            if let Some(error) = self.open_orders_failures.lock().pop_front() {
                return Err(error);
            }
            Ok(self
                .orders
                .lock()
                .iter()
                .filter(|o| !o.status.is_final())
                .cloned()
                .collect())
        })
    }

    fn accounts(&self) -> BoxFuture<'_, RestResult<Vec<AssetBalance>>> {
        Box::pin(async move { Ok(self.accounts.lock().clone()) })
    }
}
