//! The market manager: authoritative state over active sales and seller ledgers, plus
//! the sale-expiry sweeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEvent;
use crate::catalog::ItemName;
use crate::error::BrokerError;
use crate::ledger::Ledger;
use crate::sale::{Sale, SaleSnapshot};

struct ManagerState {
    ledgers: HashMap<String, Ledger>,
    sales: HashMap<String, Arc<Sale>>,
}

/// Authoritative in-memory state for the broker: seller ledgers indexed by seller id,
/// active sales indexed by sale id. All mutating operations are serialized under one
/// manager-wide lock.
pub struct MarketManager {
    state: Mutex<ManagerState>,
    sale_counter: AtomicU64,
    default_stock: f64,
    sale_duration: Duration,
    broadcast_tx: mpsc::Sender<BroadcastEvent>,
}

impl MarketManager {
    pub fn new(
        default_stock: f64,
        sale_duration: Duration,
        broadcast_tx: mpsc::Sender<BroadcastEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                ledgers: HashMap::new(),
                sales: HashMap::new(),
            }),
            sale_counter: AtomicU64::new(0),
            default_stock,
            sale_duration,
            broadcast_tx,
        })
    }

    /// Called once per seller registration. Re-registration (a returning seller within
    /// the same process lifetime) is idempotent: existing balances are preserved, never
    /// reseeded.
    pub async fn initialize_seller_stock(&self, seller_id: &str) {
        let mut state = self.state.lock().await;
        state
            .ledgers
            .entry(seller_id.to_string())
            .or_insert_with(|| Ledger::init(self.default_stock));
        debug!(seller_id, "seller stock initialized");
    }

    fn next_sale_id(&self, seller_id: &str) -> String {
        let n = self.sale_counter.fetch_add(1, Ordering::Relaxed);
        format!("{seller_id}-{n}")
    }

    /// Debits the seller's ledger and opens a new sale. Fails with `UnknownSeller`,
    /// `UnknownItem`, or `InsufficientStock` without mutating any state.
    pub async fn start_sale(
        &self,
        seller_id: &str,
        item_name: ItemName,
        quantity: f64,
    ) -> Result<Arc<Sale>, BrokerError> {
        if quantity <= 0.0 {
            return Err(BrokerError::InvalidArgument(
                "sale quantity must be positive".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        let ledger = state
            .ledgers
            .get_mut(seller_id)
            .ok_or_else(|| BrokerError::UnknownSeller { seller_id: seller_id.to_string() })?;

        // Quantity and duration are already validated above and come from this manager's
        // own configuration, so Sale::new cannot fail here; constructing it before the
        // debit means a hypothetical future failure can never leave the ledger debited
        // with no sale to show for it.
        let sale_id = self.next_sale_id(seller_id);
        let sale = Arc::new(Sale::new(
            sale_id.clone(),
            item_name,
            seller_id.to_string(),
            quantity,
            self.sale_duration,
        )?);

        ledger.debit(item_name, quantity).map_err(|err| match err {
            BrokerError::InsufficientStock { item, requested, available, .. } => {
                BrokerError::InsufficientStock {
                    seller_id: seller_id.to_string(),
                    item,
                    requested,
                    available,
                }
            }
            other => other,
        })?;

        state.sales.insert(sale_id, Arc::clone(&sale));
        info!(seller_id, %item_name, quantity, "sale started");
        Ok(sale)
    }

    /// Delegates to `Sale::try_purchase`; an absent, expired, or force-closed sale is a
    /// normal `false`, never an error.
    pub async fn handle_buy_request(
        &self,
        sale_id: &str,
        quantity: f64,
    ) -> Result<bool, BrokerError> {
        let sale = {
            let state = self.state.lock().await;
            match state.sales.get(sale_id) {
                Some(sale) => Arc::clone(sale),
                None => return Ok(false),
            }
        };
        sale.try_purchase(quantity)
    }

    /// Force-closes and removes every active sale owned by `seller_id`, crediting any
    /// unsold remainder back to the seller's ledger. Idempotent when none are active.
    /// Returns snapshots of the sales that were closed, for the caller's broadcast.
    pub async fn end_seller_sales(&self, seller_id: &str) -> Vec<SaleSnapshot> {
        let mut state = self.state.lock().await;
        let closing: Vec<String> = state
            .sales
            .iter()
            .filter(|(_, sale)| sale.seller_id == seller_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut closed = Vec::with_capacity(closing.len());
        for sale_id in closing {
            if let Some(sale) = state.sales.remove(&sale_id) {
                closed.push(self.close_and_credit(&mut state, &sale));
            }
        }
        if !closed.is_empty() {
            info!(seller_id, count = closed.len(), "seller sales ended");
        }
        closed
    }

    /// Closes a single sale already removed from the active map and credits the
    /// remainder back to its seller's ledger. Shared by `end_seller_sales` and the
    /// expiry sweeper so both route through the same close path.
    fn close_and_credit(&self, state: &mut ManagerState, sale: &Sale) -> SaleSnapshot {
        let remainder = sale.force_close();
        if remainder > 0.0 {
            if let Some(ledger) = state.ledgers.get_mut(&sale.seller_id) {
                ledger.credit(sale.item_name, remainder);
            }
        }
        sale.snapshot()
    }

    /// Immutable snapshots of all open sales; expired-but-not-yet-swept sales are
    /// filtered out.
    pub async fn get_active_items(&self) -> Vec<SaleSnapshot> {
        let state = self.state.lock().await;
        state
            .sales
            .values()
            .filter(|sale| sale.is_open())
            .map(|sale| sale.snapshot())
            .collect()
    }

    /// The seller-id owning `sale_id`, if it is still active.
    pub async fn seller_for(&self, sale_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.sales.get(sale_id).map(|sale| sale.seller_id.clone())
    }

    /// One sweep: close and reclaim every sale whose deadline has passed. Returns
    /// `true` if anything was closed, so the caller only broadcasts when something
    /// actually changed.
    async fn sweep_once(&self) -> bool {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .sales
            .iter()
            .filter(|(_, sale)| !sale.is_open())
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return false;
        }
        for sale_id in &expired {
            if let Some(sale) = state.sales.remove(sale_id) {
                self.close_and_credit(&mut state, &sale);
            }
        }
        debug!(count = expired.len(), "expiry sweep closed sales");
        true
    }

    /// Spawns the 1-tick-per-`interval` background sweeper this manager owns. On any
    /// tick that actually expires something, a STOCK_UPDATE is emitted so connected
    /// buyers learn the inventory changed even without a live request.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if manager.sweep_once().await {
                    let items = manager.get_active_items().await;
                    if manager
                        .broadcast_tx
                        .send(BroadcastEvent::StockUpdate { items })
                        .await
                        .is_err()
                    {
                        warn!("broadcast channel closed; stopping expiry sweeper");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(default_stock: f64, sale_duration: Duration) -> (Arc<MarketManager>, mpsc::Receiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (MarketManager::new(default_stock, sale_duration, tx), rx)
    }

    #[tokio::test]
    async fn happy_path_start_buy_then_end_empties_the_catalog() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        mgr.initialize_seller_stock("seller-1").await;

        let sale = mgr.start_sale("seller-1", ItemName::Flower, 50.0).await.unwrap();
        assert_eq!(mgr.get_active_items().await.len(), 1);

        assert!(mgr.handle_buy_request(&sale.id, 20.0).await.unwrap());
        assert_eq!(sale.remaining(), 30.0);

        let closed = mgr.end_seller_sales("seller-1").await;
        assert_eq!(closed.len(), 1);
        assert_eq!(mgr.get_active_items().await.len(), 0);
    }

    #[tokio::test]
    async fn round_trip_law_start_then_end_restores_ledger() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        mgr.initialize_seller_stock("seller-1").await;
        mgr.start_sale("seller-1", ItemName::Flower, 50.0).await.unwrap();
        mgr.end_seller_sales("seller-1").await;

        // Ledger is private to the manager; re-starting a sale for the full stock
        // confirms it was fully restored.
        let sale = mgr.start_sale("seller-1", ItemName::Flower, 1000.0).await.unwrap();
        assert_eq!(sale.remaining(), 1000.0);
    }

    #[tokio::test]
    async fn unknown_seller_is_rejected() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        let err = mgr.start_sale("ghost", ItemName::Oil, 1.0).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSeller { .. }));
    }

    #[tokio::test]
    async fn insufficient_stock_is_rejected_without_mutating_the_ledger() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        mgr.initialize_seller_stock("seller-1").await;
        mgr.start_sale("seller-1", ItemName::Oil, 5.0).await.unwrap();

        let err = mgr
            .start_sale("seller-1", ItemName::Oil, 9_999_996.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientStock { .. }));

        // the failed start must not have touched the ledger
        let sale = mgr.start_sale("seller-1", ItemName::Oil, 995.0).await.unwrap();
        assert_eq!(sale.remaining(), 995.0);
    }

    #[tokio::test]
    async fn buying_against_a_missing_sale_is_a_plain_false() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        assert!(!mgr.handle_buy_request("no-such-sale", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_buys_on_the_same_sale_yield_exactly_one_winner_for_the_last_unit() {
        let (mgr, _rx) = manager(1000.0, Duration::from_secs(60));
        mgr.initialize_seller_stock("seller-1").await;
        let sale = mgr.start_sale("seller-1", ItemName::Sugar, 10.0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let mgr = Arc::clone(&mgr);
            let sale_id = sale.id.clone();
            handles.push(tokio::spawn(async move {
                mgr.handle_buy_request(&sale_id, 10.0).await.unwrap()
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(sale.remaining(), 0.0);
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_sales_without_client_interaction() {
        tokio::time::pause();
        let (mgr, mut rx) = manager(1000.0, Duration::from_millis(50));
        mgr.initialize_seller_stock("seller-1").await;
        mgr.start_sale("seller-1", ItemName::Potato, 40.0).await.unwrap();

        let _sweeper = mgr.spawn_sweeper(Duration::from_millis(10));
        // advance in small steps so the spawned sweeper task gets scheduled between ticks
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(mgr.get_active_items().await.len(), 0);
        assert!(matches!(
            rx.recv().await,
            Some(BroadcastEvent::StockUpdate { .. })
        ));
    }
}
