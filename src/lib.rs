//! Approximate nearest neighbor matching engine.
//!
//! Offline, a builder partitions an embedding collection and quantizes it
//! into a compact, validated artifact on disk. Online, a query engine
//! answers top-K similarity queries in two stages (coarse partition probe,
//! quantized scan) followed by exact re-ranking, behind a small HTTP facade.

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod resolver;
pub mod server;
pub mod store;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use engine::{Neighbor, QueryEngine, QueryError, SearchConfig};
pub use error::{EngineError, EngineResult};
pub use index::{ArtifactError, BuildError, IndexArtifact, IndexBuilder, Manifest};
pub use resolver::{EmbeddingResolver, ResolverError, RetryPolicy, StoreResolver};
pub use store::VectorStore;
pub use vector::{ItemId, Metric, ProductQuantizer, Slot, VectorDimension, VectorError};
