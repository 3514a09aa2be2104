//! An asynchronous tiled raster computation engine.
//!
//! A single-threaded, message-passing [`scheduler`] coordinates the actors
//! that turn a requested output footprint into an array: a production gate
//! decides what needs computing, a cache supervisor keeps at most one
//! computation in flight per cache tile, readers/resamplers/computers fill
//! those tiles, and a merger/writer combine and persist them. External
//! threads talk to all of this only through [`engine::Engine::queue_data`]
//! and the [`query::BoundedQueue`] it returns.
//!
//! Grounded on the teacher's actor-and-message-bus architecture
//! (`service::orchestrator`/`pipeline`), generalized here from a fixed
//! satellite-tile pipeline into a scheduler over arbitrary user-supplied
//! raster descriptors.

pub mod cache_format;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod footprint;
pub mod ids;
pub mod message;
pub mod pool;
pub mod priorities_watcher;
pub mod priority;
pub mod query;
pub mod query_builder;
pub mod raster;
pub mod scheduler;

pub use config::EngineConfig;
pub use descriptor::{DType, Interpolation, Nodata, PoolAssignments, PrimitiveDescriptor, RasterDescriptor};
pub use engine::{Engine, EngineBuilder};
pub use error::{CacheError, EngineError};
pub use footprint::{AffineGrid, Footprint};
pub use ids::RasterUid;
pub use pool::PoolId;
pub use query::{Array, BoundedQueue};
