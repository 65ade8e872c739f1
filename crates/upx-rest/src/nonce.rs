//! Nonce generation for signed requests.
//!
//! Every signed request carries a nonce the exchange refuses to see twice.
//! Nonces combine wall-clock microseconds with a strictly increasing counter,
//! so they keep increasing when the clock steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for obtaining current time, enabling testability.
pub trait Clock: Send + Sync {
    /// Returns current time in microseconds since Unix epoch.
    fn now_micros(&self) -> u64;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        // A clock before the epoch reads as zero; the counter still advances.
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Issues strictly increasing nonces.
///
/// Owned by one `RestPipeline`; there is no process-wide instance.
///
/// # Guarantees
/// - Every value is greater than every value issued before it
/// - Values follow the wall clock while it moves forward
/// - Thread-safe for concurrent access
pub struct NonceManager<C: Clock> {
    /// Last issued nonce.
    counter: AtomicU64,
    /// Clock source for current time.
    clock: C,
}

impl<C: Clock> NonceManager<C> {
    /// Creates a new `NonceManager` with the given clock.
    #[must_use]
    pub fn new(clock: C) -> Self {
        let now = clock.now_micros();
        Self {
            counter: AtomicU64::new(now.saturating_sub(1)),
            clock,
        }
    }

    /// Generates the next nonce value.
    ///
    /// Returns `max(last_nonce + 1, now_micros())`. Thread-safe via CAS loop.
    pub fn next(&self) -> u64 {
        let target = self.clock.now_micros();

        loop {
            let current = self.counter.load(Ordering::Acquire);
            let next_val = current.saturating_add(1).max(target);

            match self.counter.compare_exchange_weak(
                current,
                next_val,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next_val,
                Err(_) => continue,
            }
        }
    }

    /// Last issued nonce.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

impl NonceManager<SystemClock> {
    /// Creates a new `NonceManager` with the system clock.
    #[must_use]
    pub fn with_system_clock() -> Self {
        Self::new(SystemClock)
    }
}
