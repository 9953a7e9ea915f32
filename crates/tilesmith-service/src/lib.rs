#[macro_use]
pub mod metrics;

pub mod batch;
pub mod bulk;
pub mod caching;
pub mod coalesce;
pub mod config;
pub mod dispatch;
pub mod equalizer;
pub mod error;
pub mod generators;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod types;
pub mod utils;
