//! Balance comparison between the stream view and the REST snapshot.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use upx_core::AssetBalance;

/// Allowed drift: `|tracked - exchange| <= absolute + relative * max(|tracked|, |exchange|)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceTolerance {
    pub absolute: Decimal,
    pub relative: Decimal,
}

impl Default for BalanceTolerance {
    fn default() -> Self {
        Self {
            absolute: Decimal::new(1, 8),
            relative: Decimal::new(1, 3),
        }
    }
}

impl BalanceTolerance {
    pub fn exceeded(&self, tracked: Decimal, exchange: Decimal) -> bool {
        let scale = tracked.abs().max(exchange.abs());
        (tracked - exchange).abs() > self.absolute + self.relative * scale
    }
}

/// One currency whose totals disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMismatch {
    pub currency: String,
    pub tracked: Decimal,
    pub exchange: Decimal,
}

/// Compare totals (free + locked) for every tracked currency.
///
/// A tracked currency missing from the exchange snapshot counts as zero there.
/// Currencies the stream never reported are not compared.
pub fn compare_balances(
    tracked: &[AssetBalance],
    exchange: &[AssetBalance],
    tolerance: &BalanceTolerance,
) -> Vec<BalanceMismatch> {
    let exchange: HashMap<&str, Decimal> = exchange
        .iter()
        .map(|a| (a.currency.as_str(), a.total()))
        .collect();

    tracked
        .iter()
        .filter_map(|asset| {
            let tracked_total = asset.total();
            let exchange_total = exchange
                .get(asset.currency.as_str())
                .copied()
                .unwrap_or(Decimal::ZERO);
            tolerance
                .exceeded(tracked_total, exchange_total)
                .then(|| BalanceMismatch {
                    currency: asset.currency.clone(),
                    tracked: tracked_total,
                    exchange: exchange_total,
                })
        })
        .collect()
}
