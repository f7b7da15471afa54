//! Pull-based collection from the agents

pub mod cursor;
pub mod fanout;
pub mod pipeline;

pub use fanout::{BATCH_SIZE, BatchOptions, CollectorFanout, FanoutReport};
pub use pipeline::{CollectionReport, CollectorPipeline, RowOutcome};
