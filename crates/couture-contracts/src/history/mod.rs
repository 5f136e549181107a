mod record;
mod store;

pub use record::{paginate, HistoryPage, HistoryRecord, HistorySummary};
pub use store::HistoryStore;
