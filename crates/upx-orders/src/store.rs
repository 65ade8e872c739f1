//! Concurrent order store.
//!
//! Each tracked order lives in its own `parking_lot::Mutex` cell inside a
//! `DashMap`, so transitions on one order are serialized while distinct
//! orders proceed independently. Guards are never held across an `.await`.
//!
//! Besides the live set the store keeps:
//! - an exchange uuid index
//! - a bounded set of recently evicted identifiers, so late events for
//!   finalized orders are recognized and dropped
//! - event buffers for submissions still waiting on their acknowledgement
//! - submissions whose outcome is unknown ("in doubt")

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use upx_core::{ClientOrderId, Lineage, Order, OrderEvent, OrderRequest};

/// Default number of evicted identifiers remembered.
pub const DEFAULT_RECENT_CAPACITY: usize = 1024;

/// Shared, individually locked order record.
pub type OrderCell = Arc<Mutex<Order>>;

/// A submission that may or may not have reached the exchange.
#[derive(Debug, Clone)]
pub struct InDoubtSubmission {
    pub identifier: ClientOrderId,
    pub request: OrderRequest,
    pub lineage: Option<Lineage>,
    pub retry_count: u32,
    pub since: DateTime<Utc>,
}

/// Outcome of offering an event to the in-flight buffers.
#[derive(Debug)]
pub enum Routed {
    /// Held until the submission is acknowledged.
    Buffered,
    /// The order went live in the meantime.
    Live(OrderCell, OrderEvent),
    /// Neither live nor in flight.
    Untracked(OrderEvent),
}

#[derive(Debug)]
struct RecentlyEvicted {
    order: VecDeque<ClientOrderId>,
    members: HashSet<ClientOrderId>,
    capacity: usize,
}

impl RecentlyEvicted {
    fn push(&mut self, id: ClientOrderId) {
        if !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }
}

#[derive(Debug)]
pub struct OrderStore {
    orders: DashMap<ClientOrderId, OrderCell>,
    by_uuid: DashMap<String, ClientOrderId>,
    recent: Mutex<RecentlyEvicted>,
    in_flight: DashMap<ClientOrderId, Vec<OrderEvent>>,
    in_doubt: DashMap<ClientOrderId, InDoubtSubmission>,
}

impl OrderStore {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            orders: DashMap::new(),
            by_uuid: DashMap::new(),
            recent: Mutex::new(RecentlyEvicted {
                order: VecDeque::new(),
                members: HashSet::new(),
                capacity: recent_capacity.max(1),
            }),
            in_flight: DashMap::new(),
            in_doubt: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Live set
    // ------------------------------------------------------------------------

    /// Insert a new order. An identifier that is already live keeps its cell.
    pub fn insert(&self, order: Order) -> OrderCell {
        let identifier = order.identifier.clone();
        if let Some(uuid) = &order.exchange_uuid {
            self.by_uuid.insert(uuid.clone(), identifier.clone());
        }
        self.orders
            .entry(identifier)
            .or_insert_with(|| Arc::new(Mutex::new(order)))
            .value()
            .clone()
    }

    pub fn cell(&self, identifier: &ClientOrderId) -> Option<OrderCell> {
        self.orders.get(identifier).map(|entry| entry.value().clone())
    }

    /// Identifier of the live order with this exchange uuid.
    pub fn identifier_for_uuid(&self, uuid: &str) -> Option<ClientOrderId> {
        self.by_uuid.get(uuid).map(|entry| entry.value().clone())
    }

    /// Record an exchange uuid learned after insertion.
    pub fn index_uuid(&self, uuid: &str, identifier: &ClientOrderId) {
        self.by_uuid.insert(uuid.to_string(), identifier.clone());
    }

    /// Every tracked cell. Collected first so no map guard is held while
    /// the caller locks cells.
    pub fn cells(&self) -> Vec<OrderCell> {
        self.orders.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of every tracked order.
    pub fn snapshot(&self) -> Vec<Order> {
        self.cells().iter().map(|cell| cell.lock().clone()).collect()
    }

    /// Remove a finalized order and remember its identifier.
    pub fn evict(&self, identifier: &ClientOrderId) {
        if let Some((_, cell)) = self.orders.remove(identifier) {
            if let Some(uuid) = cell.lock().exchange_uuid.clone() {
                self.by_uuid.remove(&uuid);
            }
        }
        self.recent.lock().push(identifier.clone());
    }

    pub fn recently_evicted(&self, identifier: &ClientOrderId) -> bool {
        self.recent.lock().members.contains(identifier)
    }

    /// Known in any form: live, in flight, in doubt or recently finalized.
    pub fn knows(&self, identifier: &ClientOrderId) -> bool {
        self.orders.contains_key(identifier)
            || self.in_flight.contains_key(identifier)
            || self.in_doubt.contains_key(identifier)
            || self.recently_evicted(identifier)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    // ------------------------------------------------------------------------
    // In-flight submissions
    // ------------------------------------------------------------------------

    pub fn begin_in_flight(&self, identifier: &ClientOrderId) {
        self.in_flight.insert(identifier.clone(), Vec::new());
    }

    /// Buffer an event for an in-flight identifier.
    ///
    /// If the window has already closed, the live cell is looked up again:
    /// acknowledgement inserts the cell before it closes the window, so an
    /// event racing it still reaches the order.
    pub fn buffer(&self, identifier: &ClientOrderId, event: OrderEvent) -> Routed {
        if let Some(mut buffered) = self.in_flight.get_mut(identifier) {
            buffered.push(event);
            return Routed::Buffered;
        }
        match self.cell(identifier) {
            Some(cell) => Routed::Live(cell, event),
            None => Routed::Untracked(event),
        }
    }

    /// First event buffered for an in-flight identifier.
    pub fn first_buffered(&self, identifier: &ClientOrderId) -> Option<OrderEvent> {
        self.in_flight
            .get(identifier)
            .and_then(|buffered| buffered.first().cloned())
    }

    /// End the in-flight window, returning buffered events in arrival order.
    pub fn finish_in_flight(&self, identifier: &ClientOrderId) -> Vec<OrderEvent> {
        self.in_flight
            .remove(identifier)
            .map(|(_, events)| events)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // In-doubt submissions
    // ------------------------------------------------------------------------

    pub fn mark_in_doubt(&self, submission: InDoubtSubmission) {
        self.in_doubt.insert(submission.identifier.clone(), submission);
    }

    pub fn take_in_doubt(&self, identifier: &ClientOrderId) -> Option<InDoubtSubmission> {
        self.in_doubt.remove(identifier).map(|(_, submission)| submission)
    }

    pub fn in_doubt(&self) -> Vec<InDoubtSubmission> {
        self.in_doubt.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use upx_core::{ExchangeOrderStatus, MarketCode, OrderSide, Price, Size};

    fn order(id: &str, uuid: &str) -> Order {
        let request = OrderRequest::limit(
            MarketCode::new("KRW-BTC").unwrap(),
            OrderSide::Bid,
            Size::new(dec!(0.01)),
            Price::new(dec!(50000000)),
        );
        Order::accepted(
            ClientOrderId::from_string(id),
            &request,
            Some(uuid.to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_index_and_evict() {
        let store = OrderStore::default();
        let id = ClientOrderId::from_string("upx-1-1");
        let first = store.insert(order("upx-1-1", "u-1"));
        let second = store.insert(order("upx-1-1", "u-1"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
        assert_eq!(store.identifier_for_uuid("u-1"), Some(id.clone()));

        store.evict(&id);
        assert!(store.cell(&id).is_none());
        assert!(store.identifier_for_uuid("u-1").is_none());
        assert!(store.recently_evicted(&id));
        assert!(store.knows(&id));
    }

    #[test]
    fn test_recent_set_is_bounded() {
        let store = OrderStore::new(2);
        for n in 1..=3 {
            let id = ClientOrderId::from_string(format!("upx-1-{n}"));
            store.evict(&id);
        }
        assert!(!store.recently_evicted(&ClientOrderId::from_string("upx-1-1")));
        assert!(store.recently_evicted(&ClientOrderId::from_string("upx-1-3")));
    }

    #[test]
    fn test_in_flight_buffering() {
        let store = OrderStore::default();
        let id = ClientOrderId::from_string("upx-1-1");
        let event = OrderEvent::status_only(Some(id.clone()), None, ExchangeOrderStatus::Trade);

        assert!(matches!(store.buffer(&id, event.clone()), Routed::Untracked(_)));
        store.begin_in_flight(&id);
        assert!(matches!(store.buffer(&id, event), Routed::Buffered));
        assert_eq!(store.finish_in_flight(&id).len(), 1);
        assert!(store.finish_in_flight(&id).is_empty());
    }

    #[test]
    fn test_event_after_window_closes_reaches_live_cell() {
        let store = OrderStore::default();
        let id = ClientOrderId::from_string("upx-1-1");
        let event = OrderEvent::status_only(Some(id.clone()), None, ExchangeOrderStatus::Trade);
        store.begin_in_flight(&id);

        // The acknowledgement lands between the live-set miss and buffering.
        assert!(store.cell(&id).is_none());
        let inserted = store.insert(order("upx-1-1", "u-1"));
        assert!(store.finish_in_flight(&id).is_empty());

        match store.buffer(&id, event) {
            Routed::Live(cell, routed) => {
                assert!(Arc::ptr_eq(&cell, &inserted));
                assert_eq!(routed.status, ExchangeOrderStatus::Trade);
            }
            other => panic!("expected live routing, got {other:?}"),
        }
    }
}
