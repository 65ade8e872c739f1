//! Client order identifier generation.
//!
//! Base identifiers are `<prefix>-<epoch-ms>-<seq>`. Resubmissions append
//! `-r<n>` with `n` counted per root, so an identifier is never handed out
//! twice within a process.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use upx_core::ClientOrderId;

/// Default identifier prefix.
pub const DEFAULT_ID_PREFIX: &str = "upx";

#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    seq: AtomicU64,
    retries: DashMap<ClientOrderId, u32>,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            seq: AtomicU64::new(0),
            retries: DashMap::new(),
        }
    }

    /// Fresh root identifier.
    pub fn next(&self) -> ClientOrderId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        ClientOrderId::base(&self.prefix, Utc::now().timestamp_millis(), seq)
    }

    /// Identifier for the next resubmission of `root`, with its attempt number.
    pub fn next_retry(&self, root: &ClientOrderId) -> (ClientOrderId, u32) {
        let mut attempt = self.retries.entry(root.clone()).or_insert(0);
        *attempt += 1;
        (ClientOrderId::retry_of(root, *attempt), *attempt)
    }

    /// Make sure later retries of `root` start after `attempt`.
    ///
    /// Used when an order with a retry suffix is adopted from the exchange.
    pub fn observe(&self, identifier: &ClientOrderId) {
        if let Some((root, attempt)) = identifier.retry_parts() {
            let mut current = self.retries.entry(root).or_insert(0);
            if *current < attempt {
                *current = attempt;
            }
        }
    }

    /// Forget the retry counter of a finished lineage.
    pub fn forget(&self, root: &ClientOrderId) {
        self.retries.remove(root);
    }

    /// Number of lineages with a retry counter.
    pub fn tracked_lineages(&self) -> usize {
        self.retries.len()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_PREFIX)
    }
}
