// =============================================================================
// Repository: storage seam for wallets, trades and pending orders
// =============================================================================
//
// The engine never talks to a database directly. It reads and writes records
// through this trait; `MemoryRepository` is the process-local implementation
// used by the service binary and by tests.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;

use super::models::{PendingOrder, Trade, Wallet};

/// Record storage consumed by the trade engine.
///
/// Implementations must be safe to call from several threads. Writes are
/// whole-record upserts; the engine provides the per-user serialisation.
pub trait Repository: Send + Sync {
    fn wallet(&self, user_id: &str) -> Result<Option<Wallet>>;
    fn save_wallet(&self, wallet: &Wallet) -> Result<()>;

    fn trade(&self, id: &str) -> Result<Option<Trade>>;
    fn save_trade(&self, trade: &Trade) -> Result<()>;
    /// Open and partially-closed trades across all users.
    fn active_trades(&self) -> Result<Vec<Trade>>;
    /// Every trade of one user, oldest first.
    fn user_trades(&self, user_id: &str) -> Result<Vec<Trade>>;

    fn order(&self, id: &str) -> Result<Option<PendingOrder>>;
    fn save_order(&self, order: &PendingOrder) -> Result<()>;
    /// Orders still in `pending` across all users.
    fn pending_orders(&self) -> Result<Vec<PendingOrder>>;
    /// Every order of one user, oldest first.
    fn user_orders(&self, user_id: &str) -> Result<Vec<PendingOrder>>;
}

/// In-memory repository backed by hash maps.
#[derive(Default)]
pub struct MemoryRepository {
    wallets: RwLock<HashMap<String, Wallet>>,
    trades: RwLock<HashMap<String, Trade>>,
    orders: RwLock<HashMap<String, PendingOrder>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_trades(mut trades: Vec<Trade>) -> Vec<Trade> {
    trades.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
    trades
}

fn sort_orders(mut orders: Vec<PendingOrder>) -> Vec<PendingOrder> {
    orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    orders
}

impl Repository for MemoryRepository {
    fn wallet(&self, user_id: &str) -> Result<Option<Wallet>> {
        Ok(self.wallets.read().get(user_id).cloned())
    }

    fn save_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.wallets
            .write()
            .insert(wallet.user_id.clone(), wallet.clone());
        Ok(())
    }

    fn trade(&self, id: &str) -> Result<Option<Trade>> {
        Ok(self.trades.read().get(id).cloned())
    }

    fn save_trade(&self, trade: &Trade) -> Result<()> {
        self.trades.write().insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    fn active_trades(&self) -> Result<Vec<Trade>> {
        let trades = self
            .trades
            .read()
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        Ok(sort_trades(trades))
    }

    fn user_trades(&self, user_id: &str) -> Result<Vec<Trade>> {
        let trades = self
            .trades
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        Ok(sort_trades(trades))
    }

    fn order(&self, id: &str) -> Result<Option<PendingOrder>> {
        Ok(self.orders.read().get(id).cloned())
    }

    fn save_order(&self, order: &PendingOrder) -> Result<()> {
        self.orders.write().insert(order.id.clone(), order.clone());
        Ok(())
    }

    fn pending_orders(&self) -> Result<Vec<PendingOrder>> {
        let orders = self
            .orders
            .read()
            .values()
            .filter(|o| o.is_pending())
            .cloned()
            .collect();
        Ok(sort_orders(orders))
    }

    fn user_orders(&self, user_id: &str) -> Result<Vec<PendingOrder>> {
        let orders = self
            .orders
            .read()
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        Ok(sort_orders(orders))
    }
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("wallets", &self.wallets.read().len())
            .field("trades", &self.trades.read().len())
            .field("orders", &self.orders.read().len())
            .finish()
    }
}
