//! Domain models shared across the whole tickwire service.

pub mod order;
pub mod settings;
pub mod tick;

pub use order::{AuditKind, AuditRecord, AuditStatus, Order, OrderStatus, Position};
pub use settings::{Account, AccountStatus, AdminSettings, BuyLogic};
pub use tick::{DepthEntry, DepthSide, Ohlc, SymbolMap, Tick, TickSummary};
