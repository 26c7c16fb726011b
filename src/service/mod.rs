pub mod alert_engine;
pub mod dispatcher;
pub mod ingest;
pub mod listener;
pub mod thresholds;

pub use alert_engine::AlertEngine;
pub use dispatcher::SyncDispatcher;
pub use ingest::IngestService;
pub use thresholds::ThresholdService;
