//! Pattern and insight aggregators: cron-invoked passes that turn repeated
//! observations across the graph into higher-order records (§4.7).

pub mod insight;
pub mod pattern;

pub use insight::{InsightAggregationResult, InsightAggregator};
pub use pattern::{PatternAggregationResult, PatternAggregator};
