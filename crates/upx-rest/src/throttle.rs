//! Per-group request throttling.
//!
//! The exchange enforces separate per-second budgets per endpoint group and
//! reports what is left in every response (`Remaining-Req`). Each group keeps
//! a sliding one-second window of its own sends (a static cap that holds
//! before any header was seen) and the last observed remaining count. A call
//! that would exceed either waits; it is never sent early.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Length of the exchange quota window.
const WINDOW: Duration = Duration::from_secs(1);

/// Logical bucket of endpoints sharing one rate-limit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleGroup {
    /// Order placement.
    Order,
    /// Order lookup, open orders and cancels.
    OrderQuery,
    /// Balances.
    Account,
    /// Public quotation endpoints.
    MarketData,
}

impl ThrottleGroup {
    pub const ALL: [ThrottleGroup; 4] = [
        Self::Order,
        Self::OrderQuery,
        Self::Account,
        Self::MarketData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::OrderQuery => "order_query",
            Self::Account => "account",
            Self::MarketData => "market_data",
        }
    }
}

impl fmt::Display for ThrottleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `Remaining-Req: group=default; min=1800; sec=29`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingReq {
    pub group: String,
    pub min: Option<u32>,
    pub sec: u32,
}

impl RemainingReq {
    /// Parse the header value. Returns `None` when `sec` is missing.
    pub fn parse(header: &str) -> Option<Self> {
        let mut group = String::new();
        let mut min = None;
        let mut sec = None;

        for token in header.split(';') {
            let Some((key, value)) = token.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                "group" => group = value.trim().to_string(),
                "min" => min = value.trim().parse().ok(),
                "sec" => sec = value.trim().parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            group,
            min,
            sec: sec?,
        })
    }
}

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_order_per_sec")]
    pub order_per_sec: u32,
    #[serde(default = "default_query_per_sec")]
    pub order_query_per_sec: u32,
    #[serde(default = "default_query_per_sec")]
    pub account_per_sec: u32,
    #[serde(default = "default_market_data_per_sec")]
    pub market_data_per_sec: u32,
    /// A group whose observed remaining count is at or below this waits for
    /// the window to reset.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u32,
}

fn default_order_per_sec() -> u32 {
    7
}

fn default_query_per_sec() -> u32 {
    25
}

fn default_market_data_per_sec() -> u32 {
    10
}

fn default_safety_margin() -> u32 {
    1
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            order_per_sec: default_order_per_sec(),
            order_query_per_sec: default_query_per_sec(),
            account_per_sec: default_query_per_sec(),
            market_data_per_sec: default_market_data_per_sec(),
            safety_margin: default_safety_margin(),
        }
    }
}

impl ThrottleConfig {
    fn limit_for(&self, group: ThrottleGroup) -> u32 {
        match group {
            ThrottleGroup::Order => self.order_per_sec,
            ThrottleGroup::OrderQuery => self.order_query_per_sec,
            ThrottleGroup::Account => self.account_per_sec,
            ThrottleGroup::MarketData => self.market_data_per_sec,
        }
        .max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    remaining: u32,
    reset_at: Instant,
}

/// Budget of one throttle group.
#[derive(Debug)]
struct GroupBudget {
    limit_per_sec: u32,
    sent: VecDeque<Instant>,
    observed: Option<Observed>,
    blocked_until: Option<Instant>,
}

impl GroupBudget {
    fn new(limit_per_sec: u32) -> Self {
        Self {
            limit_per_sec,
            sent: VecDeque::with_capacity(limit_per_sec as usize),
            observed: None,
            blocked_until: None,
        }
    }

    /// Reserve a send slot, or return when to try again.
    fn try_reserve(&mut self, now: Instant, margin: u32) -> Result<(), Instant> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until);
            }
            self.blocked_until = None;
        }

        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() >= self.limit_per_sec as usize {
            if let Some(&oldest) = self.sent.front() {
                return Err(oldest + WINDOW);
            }
        }

        if let Some(observed) = self.observed {
            if now >= observed.reset_at {
                self.observed = None;
            } else if observed.remaining <= margin {
                return Err(observed.reset_at);
            } else {
                self.observed = Some(Observed {
                    remaining: observed.remaining - 1,
                    ..observed
                });
            }
        }

        self.sent.push_back(now);
        Ok(())
    }
}

/// Throttle shared by all calls of one pipeline.
pub struct Throttle {
    safety_margin: u32,
    groups: HashMap<ThrottleGroup, Mutex<GroupBudget>>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        let groups = ThrottleGroup::ALL
            .iter()
            .map(|g| (*g, Mutex::new(GroupBudget::new(config.limit_for(*g)))))
            .collect();
        Self {
            safety_margin: config.safety_margin,
            groups,
        }
    }

    fn budget(&self, group: ThrottleGroup) -> &Mutex<GroupBudget> {
        // Every group is inserted in `new`.
        &self.groups[&group]
    }

    /// Wait until a call in `group` fits the budget, then reserve it.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self, group: ThrottleGroup) -> Duration {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            let verdict = self.budget(group).lock().try_reserve(now, self.safety_margin);
            match verdict {
                Ok(()) => return now.duration_since(started),
                Err(retry_at) => {
                    debug!(
                        %group,
                        wait_ms = retry_at.saturating_duration_since(now).as_millis() as u64,
                        "Throttle delaying call"
                    );
                    tokio::time::sleep_until(retry_at).await;
                }
            }
        }
    }

    /// Record the remaining quota reported by a response.
    ///
    /// Within an open window the lower count wins: a response to an earlier
    /// call can arrive after later calls were reserved.
    pub fn observe(&self, group: ThrottleGroup, remaining: &RemainingReq) {
        let now = Instant::now();
        let mut budget = self.budget(group).lock();
        budget.observed = Some(match budget.observed {
            Some(current) if now < current.reset_at => Observed {
                remaining: current.remaining.min(remaining.sec),
                ..current
            },
            _ => Observed {
                remaining: remaining.sec,
                reset_at: now + WINDOW,
            },
        });
        if remaining.sec <= self.safety_margin {
            warn!(
                %group,
                exchange_group = %remaining.group,
                sec = remaining.sec,
                min = ?remaining.min,
                "Rate budget nearly exhausted"
            );
        }
    }

    /// Hold every call in `group` until `until` (after a 429/418).
    pub fn block_until(&self, group: ThrottleGroup, until: Instant) {
        let mut budget = self.budget(group).lock();
        budget.blocked_until = Some(budget.blocked_until.map_or(until, |b| b.max(until)));
    }

    /// Last observed remaining count, if still within its window.
    pub fn remaining(&self, group: ThrottleGroup) -> Option<u32> {
        let now = Instant::now();
        self.budget(group)
            .lock()
            .observed
            .filter(|o| now < o.reset_at)
            .map(|o| o.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remaining(sec: u32) -> RemainingReq {
        RemainingReq {
            group: "default".into(),
            min: Some(1800),
            sec,
        }
    }

    fn config(per_sec: u32, margin: u32) -> ThrottleConfig {
        ThrottleConfig {
            order_per_sec: per_sec,
            order_query_per_sec: per_sec,
            account_per_sec: per_sec,
            market_data_per_sec: per_sec,
            safety_margin: margin,
        }
    }

    #[test]
    fn test_parse_remaining_req() {
        let parsed = RemainingReq::parse("group=order; min=59; sec=6").unwrap();
        assert_eq!(parsed.group, "order");
        assert_eq!(parsed.min, Some(59));
        assert_eq!(parsed.sec, 6);

        let parsed = RemainingReq::parse("sec=0;group=default").unwrap();
        assert_eq!(parsed.sec, 0);
        assert_eq!(parsed.min, None);

        assert!(RemainingReq::parse("group=default; min=10").is_none());
        assert!(RemainingReq::parse("").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_never_exceed_observed_remaining() {
        let throttle = Throttle::new(config(100, 0));
        throttle.observe(ThrottleGroup::MarketData, &remaining(3));

        let start = Instant::now();
        let mut before_reset = 0;
        for _ in 0..6 {
            throttle.acquire(ThrottleGroup::MarketData).await;
            if Instant::now() < start + WINDOW {
                before_reset += 1;
            }
        }
        assert_eq!(before_reset, 3);
        assert!(Instant::now() >= start + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_margin_reserves_headroom() {
        let throttle = Throttle::new(config(100, 1));
        throttle.observe(ThrottleGroup::Order, &remaining(3));

        let start = Instant::now();
        throttle.acquire(ThrottleGroup::Order).await;
        throttle.acquire(ThrottleGroup::Order).await;
        assert_eq!(Instant::now(), start);
        assert_eq!(throttle.remaining(ThrottleGroup::Order), Some(1));

        let waited = throttle.acquire(ThrottleGroup::Order).await;
        assert_eq!(waited, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_cap_applies_without_header() {
        let throttle = Throttle::new(config(2, 0));
        let start = Instant::now();
        for _ in 0..2 {
            throttle.acquire(ThrottleGroup::Account).await;
        }
        assert_eq!(Instant::now(), start);

        throttle.acquire(ThrottleGroup::Account).await;
        assert_eq!(Instant::now(), start + WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_independent() {
        let throttle = Throttle::new(config(100, 0));
        throttle.observe(ThrottleGroup::Order, &remaining(0));

        let start = Instant::now();
        throttle.acquire(ThrottleGroup::OrderQuery).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_until_holds_group() {
        let throttle = Throttle::new(config(100, 0));
        let start = Instant::now();
        throttle.block_until(ThrottleGroup::Order, start + Duration::from_secs(4));

        let waited = throttle.acquire(ThrottleGroup::Order).await;
        assert_eq!(waited, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_cannot_raise_remaining() {
        let throttle = Throttle::new(config(100, 0));
        throttle.observe(ThrottleGroup::Order, &remaining(2));
        throttle.observe(ThrottleGroup::Order, &remaining(7));
        assert_eq!(throttle.remaining(ThrottleGroup::Order), Some(2));

        tokio::time::advance(WINDOW).await;
        throttle.observe(ThrottleGroup::Order, &remaining(7));
        assert_eq!(throttle.remaining(ThrottleGroup::Order), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_acquire_wakes_at_deadline() {
        let throttle = Throttle::new(config(100, 0));
        throttle.block_until(ThrottleGroup::Order, Instant::now() + Duration::from_secs(2));

        let mut acquire = tokio_test::task::spawn(throttle.acquire(ThrottleGroup::Order));
        tokio_test::assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(acquire.is_woken());
        let waited = tokio_test::assert_ready!(acquire.poll());
        assert_eq!(waited, Duration::from_secs(2));
    }
}
