//! Balance view maintained from the `myAsset` stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use upx_core::AssetBalance;
use upx_ws::AssetSnapshot;

#[derive(Debug, Default)]
struct Inner {
    balances: BTreeMap<String, AssetBalance>,
    updated_at: Option<DateTime<Utc>>,
}

/// Latest balances pushed by the exchange. Each snapshot replaces the
/// previous one.
#[derive(Debug, Default)]
pub struct Portfolio {
    inner: RwLock<Inner>,
}

impl Portfolio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the view with a snapshot. Empty snapshots are ignored.
    pub fn apply(&self, snapshot: &AssetSnapshot) {
        if snapshot.assets.is_empty() {
            trace!("Empty asset snapshot ignored");
            return;
        }
        let balances = snapshot
            .assets
            .iter()
            .map(|asset| (asset.currency.clone(), asset.clone()))
            .collect();
        let mut inner = self.inner.write();
        inner.balances = balances;
        inner.updated_at = Some(snapshot.timestamp.unwrap_or_else(Utc::now));
    }

    pub fn get(&self, currency: &str) -> Option<AssetBalance> {
        self.inner.read().balances.get(currency).cloned()
    }

    /// Balances ordered by currency.
    pub fn balances(&self) -> Vec<AssetBalance> {
        self.inner.read().balances.values().cloned().collect()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().balances.is_empty()
    }
}

/// Apply stream balance snapshots until the channel closes or shutdown.
pub async fn pump_assets(
    portfolio: Arc<Portfolio>,
    mut snapshots: mpsc::Receiver<AssetSnapshot>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => portfolio.apply(&snapshot),
                None => break,
            },
        }
    }
    debug!("Asset pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn asset(currency: &str, balance: rust_decimal::Decimal) -> AssetBalance {
        AssetBalance {
            currency: currency.to_string(),
            balance,
            locked: dec!(0),
            avg_buy_price: dec!(0),
        }
    }

    #[test]
    fn test_snapshot_replaces_previous_view() {
        let portfolio = Portfolio::new();
        portfolio.apply(&AssetSnapshot {
            assets: vec![asset("BTC", dec!(0.1))],
            timestamp: None,
        });
        portfolio.apply(&AssetSnapshot {
            assets: vec![asset("KRW", dec!(1000)), asset("BTC", dec!(0.2))],
            timestamp: None,
        });

        let currencies: Vec<String> = portfolio
            .balances()
            .into_iter()
            .map(|a| a.currency)
            .collect();
        assert_eq!(currencies, vec!["BTC", "KRW"]);
        assert_eq!(portfolio.get("BTC").unwrap().balance, dec!(0.2));
        assert!(portfolio.updated_at().is_some());
    }

    #[test]
    fn test_empty_snapshot_keeps_view() {
        let portfolio = Portfolio::new();
        portfolio.apply(&AssetSnapshot {
            assets: vec![asset("KRW", dec!(1000))],
            timestamp: None,
        });
        portfolio.apply(&AssetSnapshot {
            assets: Vec::new(),
            timestamp: None,
        });
        assert!(!portfolio.is_empty());
    }
}
