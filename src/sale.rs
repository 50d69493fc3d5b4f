//! The sale object: a single time-bounded offer with an atomic
//! "check remaining and decrement" primitive.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::catalog::ItemName;
use crate::error::BrokerError;

/// Mutable state guarded by `Sale::inner`. Nothing in this critical section ever
/// awaits, so a plain `std::sync::Mutex` is correct and cheaper than an async one.
#[derive(Debug)]
struct Inner {
    remaining_quantity: f64,
    forced_closed: bool,
}

/// A single seller's time-bounded offer of `quantity` units of `item_name`.
#[derive(Debug)]
pub struct Sale {
    pub id: String,
    pub item_name: ItemName,
    pub seller_id: String,
    pub start_time: Instant,
    pub duration: Duration,
    inner: Mutex<Inner>,
}

/// An immutable value copy of a Sale, safe to ship over the wire without further
/// synchronization.
#[derive(Debug, Clone, Serialize)]
pub struct SaleSnapshot {
    pub id: String,
    pub name: ItemName,
    pub quantity: f64,
    #[serde(rename = "sellerId")]
    pub seller_id: String,
    #[serde(rename = "remainingTime")]
    pub remaining_time_ms: u64,
}

impl Sale {
    /// Constructs a new open sale. `duration` must be in `(0, 60s]`; the manager is the
    /// only caller and always supplies the configured sale duration.
    pub fn new(
        id: String,
        item_name: ItemName,
        seller_id: String,
        quantity: f64,
        duration: Duration,
    ) -> Result<Self, BrokerError> {
        if duration.is_zero() || duration > Duration::from_secs(60) {
            return Err(BrokerError::InvalidArgument(format!(
                "sale duration must be in (0, 60s], got {:?}",
                duration
            )));
        }
        if quantity <= 0.0 {
            return Err(BrokerError::InvalidArgument(
                "sale quantity must be positive".to_string(),
            ));
        }
        Ok(Self {
            id,
            item_name,
            seller_id,
            start_time: Instant::now(),
            duration,
            inner: Mutex::new(Inner {
                remaining_quantity: quantity,
                forced_closed: false,
            }),
        })
    }

    fn deadline(&self) -> Instant {
        self.start_time + self.duration
    }

    /// `remaining_quantity`, regardless of open/expired state.
    pub fn remaining(&self) -> f64 {
        self.inner.lock().unwrap().remaining_quantity
    }

    /// True iff not force-closed and the deadline has not passed.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.forced_closed && Instant::now() < self.deadline()
    }

    /// `max(0, deadline - now)`, or zero once force-closed.
    pub fn remaining_time(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        if inner.forced_closed {
            return Duration::ZERO;
        }
        self.deadline().saturating_duration_since(Instant::now())
    }

    /// Atomically checks that the sale is open and has at least `amount` remaining,
    /// and if so decrements by `amount`. Returns `false` for any other reason
    /// (expired, force-closed, insufficient quantity) — never an error for "sold out".
    pub fn try_purchase(&self, amount: f64) -> Result<bool, BrokerError> {
        if amount <= 0.0 {
            return Err(BrokerError::InvalidArgument(
                "purchase amount must be positive".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.forced_closed || Instant::now() >= self.deadline() {
            return Ok(false);
        }
        if inner.remaining_quantity < amount {
            return Ok(false);
        }
        inner.remaining_quantity -= amount;
        Ok(true)
    }

    /// Idempotent. Marks the sale closed and zeroes its observable remaining time.
    /// Returns the `remaining_quantity` at the moment of closing, so the caller (the
    /// Manager) can credit it back to the ledger; a second call returns `0.0`.
    pub fn force_close(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.forced_closed {
            return 0.0;
        }
        inner.forced_closed = true;
        let remainder = inner.remaining_quantity;
        inner.remaining_quantity = 0.0;
        remainder
    }

    pub fn snapshot(&self) -> SaleSnapshot {
        SaleSnapshot {
            id: self.id.clone(),
            name: self.item_name,
            quantity: self.remaining(),
            seller_id: self.seller_id.clone(),
            remaining_time_ms: self.remaining_time().as_millis() as u64,
        }
    }
}
