pub mod alert_repository;
pub mod memory;
pub mod pool_repository;
pub mod price_history_repository;
pub mod token_repository;

pub use alert_repository::{AlertRepository, PostgresAlertRepository};
pub use memory::{InMemoryStore, Operation};
pub use pool_repository::{PostgresYieldPoolRepository, YieldPoolRepository};
pub use price_history_repository::{PostgresPriceHistoryRepository, PriceHistoryRepository};
pub use token_repository::{PostgresTokenRepository, TokenRepository};
