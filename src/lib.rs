//! Parallel, vectorized execution engine for PromQL-style queries: a parsed
//! expression is mapped onto a tree of pull-based operators exchanging
//! pooled step-vector batches, with selector fan-out merged by a coalesce
//! exchange.

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod labels;
pub mod model;
pub mod storage;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use labels::Labels;
pub use model::{QueryValue, Sample, TimeSeries, VectorSample};
pub use storage::{MemoryStorage, SeriesStorage, StorageSeries};
