//! Prometheus metrics for upx.
//!
//! Covers:
//! - Stream connection state, reconnects and frame dispatch
//! - REST calls per throttle group, rate-limit backoffs and throttle waits
//! - Order state transitions, timeouts and submit failures
//! - Reconciliation sweeps, adoptions and balance mismatches
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a programming error caught at first use.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, register_int_gauge, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    IntCounter, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

// =============================================================================
// Stream
// =============================================================================

/// Stream connection state (1 = live, 0 = otherwise).
pub static WS_LIVE: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("upx_ws_live", "Stream connection is live (1=live)").unwrap());

/// Stream state machine current state.
/// Labels: state (disconnected/connecting/subscribing/live/idle_detected/errored/reconnecting)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "upx_ws_state",
        "Stream state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total stream reconnects.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_ws_reconnect_total",
        "Total stream reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Frames dispatched to handlers.
pub static WS_FRAMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_ws_frames_total",
        "Stream frames dispatched by kind",
        &["kind"]
    )
    .unwrap()
});

/// Frames dropped because a handler channel was full or closed.
pub static WS_FRAMES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_ws_frames_dropped_total",
        "Stream frames dropped by kind",
        &["kind"]
    )
    .unwrap()
});

// =============================================================================
// REST pipeline
// =============================================================================

/// REST calls by throttle group and outcome.
pub static REST_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_rest_requests_total",
        "REST calls by throttle group and status",
        &["group", "status"]
    )
    .unwrap()
});

/// REST latency in milliseconds.
pub static REST_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "upx_rest_latency_ms",
        "REST call latency in milliseconds",
        &["group"],
        vec![5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 3000.0, 10000.0]
    )
    .unwrap()
});

/// 429/418 backoffs.
pub static RATE_LIMIT_BACKOFF_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_rate_limit_backoff_total",
        "Rate-limit backoffs by throttle group and status",
        &["group", "status"]
    )
    .unwrap()
});

/// Time spent waiting in the throttle.
pub static THROTTLE_WAIT_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "upx_throttle_wait_ms",
        "Throttle wait before a call in milliseconds",
        &["group"],
        vec![0.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]
    )
    .unwrap()
});

// =============================================================================
// Orders
// =============================================================================

/// Order state transitions.
pub static ORDER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_order_transitions_total",
        "Order state transitions",
        &["from", "to"]
    )
    .unwrap()
});

/// Orders currently tracked.
pub static ORDERS_LIVE: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("upx_orders_live", "Orders currently tracked").unwrap());

/// Orders that hit the business timeout.
pub static ORDER_TIMEOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("upx_order_timeouts_total", "Orders that timed out").unwrap()
});

/// Failed submissions by error kind.
pub static ORDER_SUBMIT_FAILED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_order_submit_failed_total",
        "Failed order submissions by error kind",
        &["kind"]
    )
    .unwrap()
});

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconciliation sweeps by outcome.
pub static RECON_SWEEPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_recon_sweeps_total",
        "Reconciliation sweeps by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Orders adopted from the exchange snapshot.
pub static RECON_ADOPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "upx_recon_adopted_total",
        "Exchange orders adopted by reconciliation"
    )
    .unwrap()
});

/// Balance mismatches by currency.
pub static BALANCE_MISMATCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_balance_mismatch_total",
        "Balance mismatches between stream and REST snapshots",
        &["currency"]
    )
    .unwrap()
});

/// Lifecycle notifications by kind.
pub static LIFECYCLE_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upx_lifecycle_events_total",
        "Lifecycle notifications by kind",
        &["kind"]
    )
    .unwrap()
});

const WS_STATES: [&str; 7] = [
    "disconnected",
    "connecting",
    "subscribing",
    "live",
    "idle_detected",
    "errored",
    "reconnecting",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    // =========================================================================
    // Stream
    // =========================================================================

    /// Set stream state. Only the active state is 1.
    pub fn ws_state_set(state: &str) {
        for s in &WS_STATES {
            WS_STATE.with_label_values(&[s]).set(0.0);
        }
        WS_STATE.with_label_values(&[state]).set(1.0);
        WS_LIVE.set(if state == "live" { 1.0 } else { 0.0 });
    }

    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn ws_frame(kind: &str) {
        WS_FRAMES_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn ws_frame_dropped(kind: &str) {
        WS_FRAMES_DROPPED_TOTAL.with_label_values(&[kind]).inc();
    }

    // =========================================================================
    // REST
    // =========================================================================

    /// Record one REST attempt. `status` is the HTTP status or `network`.
    pub fn rest_request(group: &str, status: &str, latency_ms: f64) {
        REST_REQUESTS_TOTAL
            .with_label_values(&[group, status])
            .inc();
        REST_LATENCY_MS
            .with_label_values(&[group])
            .observe(latency_ms);
    }

    pub fn rate_limit_backoff(group: &str, status: u16) {
        RATE_LIMIT_BACKOFF_TOTAL
            .with_label_values(&[group, &status.to_string()])
            .inc();
    }

    pub fn throttle_wait(group: &str, wait_ms: f64) {
        THROTTLE_WAIT_MS.with_label_values(&[group]).observe(wait_ms);
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub fn order_transition(from: &str, to: &str) {
        ORDER_TRANSITIONS_TOTAL
            .with_label_values(&[from, to])
            .inc();
    }

    pub fn orders_live_set(count: i64) {
        ORDERS_LIVE.set(count);
    }

    pub fn order_timeout() {
        ORDER_TIMEOUTS_TOTAL.inc();
    }

    pub fn order_submit_failed(kind: &str) {
        ORDER_SUBMIT_FAILED_TOTAL.with_label_values(&[kind]).inc();
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub fn recon_sweep(outcome: &str) {
        RECON_SWEEPS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn recon_adopted() {
        RECON_ADOPTED_TOTAL.inc();
    }

    pub fn balance_mismatch(currency: &str) {
        BALANCE_MISMATCH_TOTAL
            .with_label_values(&[currency])
            .inc();
    }

    pub fn lifecycle_event(kind: &str) {
        LIFECYCLE_EVENTS_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Text exposition of every registered metric.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
