//! Market identifiers and quote-currency price rules.

use crate::error::{CoreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchange market code in `QUOTE-BASE` form (e.g. `KRW-BTC`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketCode(String);

impl MarketCode {
    /// Parse and validate a market code.
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        match code.split_once('-') {
            Some((quote, base))
                if !quote.is_empty()
                    && !base.is_empty()
                    && !base.contains('-')
                    && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
            {
                Ok(Self(code.to_ascii_uppercase()))
            }
            _ => Err(CoreError::InvalidMarket(code)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quote currency (`KRW` in `KRW-BTC`).
    pub fn quote(&self) -> &str {
        self.0.split_once('-').map(|(q, _)| q).unwrap_or_default()
    }

    /// Base currency (`BTC` in `KRW-BTC`).
    pub fn base(&self) -> &str {
        self.0.split_once('-').map(|(_, b)| b).unwrap_or_default()
    }

    /// Whether prices on this market follow the KRW tick table.
    pub fn is_krw(&self) -> bool {
        self.quote() == "KRW"
    }
}

impl fmt::Display for MarketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MarketCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for MarketCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MarketCode> for String {
    fn from(code: MarketCode) -> Self {
        code.0
    }
}

/// KRW market tick size for a given price level.
pub fn krw_tick_size(price: Decimal) -> Decimal {
    // (bound mantissa, bound scale, tick mantissa, tick scale), highest band first.
    const TABLE: [(i64, u32, i64, u32); 13] = [
        (2_000_000, 0, 1000, 0),
        (1_000_000, 0, 500, 0),
        (500_000, 0, 100, 0),
        (100_000, 0, 50, 0),
        (10_000, 0, 10, 0),
        (1_000, 0, 1, 0),
        (100, 0, 1, 1),
        (10, 0, 1, 2),
        (1, 0, 1, 3),
        (1, 1, 1, 4),
        (1, 2, 1, 5),
        (1, 3, 1, 6),
        (0, 0, 1, 7),
    ];

    for (bound, bound_scale, tick, tick_scale) in TABLE {
        if price >= Decimal::new(bound, bound_scale) {
            return Decimal::new(tick, tick_scale);
        }
    }
    Decimal::new(1, 7)
}
