// 数据面模块
pub mod aggregator;
pub mod backfill;
pub mod reconciliation;
pub mod streamer;
pub mod universe;
pub mod worker;

pub use aggregator::CandleAggregator;
pub use backfill::CandleBackfiller;
pub use reconciliation::ReconciliationService;
pub use streamer::TradeStreamer;
pub use universe::{ConfigUniverse, UniverseProvider};
pub use worker::Worker;
