pub mod alert;
pub mod history;
pub mod notifier;
pub mod price_refresh;

pub use alert::{AlertEvaluationReport, AlertEvaluator, ALERT_EVALUATION_JOB};
pub use history::HistoryBackfill;
pub use notifier::HttpNotifier;
pub use price_refresh::{PriceRefreshReport, PriceRefresher, PRICE_REFRESH_JOB};
