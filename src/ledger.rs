//! The inventory ledger: a pure per-seller stock data structure. All synchronization is
//! supplied by the manager that owns it.

use std::collections::HashMap;

use crate::catalog::ItemName;
use crate::error::BrokerError;

/// Per-seller mapping from item name to on-hand quantity not currently committed to
/// any active sale.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    balances: HashMap<ItemName, f64>,
}

impl Ledger {
    /// Seeds every catalog item with `default_stock`. Re-initialization overwrites any
    /// existing balances.
    pub fn init(default_stock: f64) -> Self {
        let mut balances = HashMap::with_capacity(ItemName::ALL.len());
        for item in ItemName::ALL {
            balances.insert(item, default_stock);
        }
        Self { balances }
    }

    pub fn available(&self, item: ItemName) -> f64 {
        *self.balances.get(&item).unwrap_or(&0.0)
    }

    /// Debits `amount` from `item`'s balance. Rejected (no mutation) if it would go
    /// negative.
    pub fn debit(&mut self, item: ItemName, amount: f64) -> Result<(), BrokerError> {
        let available = self.available(item);
        if available < amount {
            return Err(BrokerError::InsufficientStock {
                seller_id: String::new(),
                item,
                requested: amount,
                available,
            });
        }
        self.balances.insert(item, available - amount);
        Ok(())
    }

    pub fn credit(&mut self, item: ItemName, amount: f64) {
        let available = self.available(item);
        self.balances.insert(item, available + amount);
    }
}
