pub mod collector;
pub mod model;
pub mod store;

pub(crate) mod concurrent_map;

pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod init_logging;
pub mod ledger;
pub mod resolver;
pub mod sampler;
pub mod stats;

pub use collector::{Collector, CollectorConfig, Stores};
pub use error::{Error, StoreError};
pub use sampler::{RateSampler, SamplerConfig};
