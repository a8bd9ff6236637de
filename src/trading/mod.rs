pub mod engine;
pub mod models;
pub mod monitor;
pub mod repository;
pub mod validation;

pub use engine::{OpenTradeRequest, OrderChanges, PendingOrderRequest, SweepReport, TradeEngine};
pub use models::{PendingOrder, Trade, Wallet};
pub use repository::{MemoryRepository, Repository};
pub use validation::TradingLimits;
