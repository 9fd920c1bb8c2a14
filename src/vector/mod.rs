//! Vector primitives for the matching engine.
//!
//! Distance kernels, k-means clustering, and product quantization. The
//! index builder composes these offline; the query engine uses the same
//! kernels online for coarse selection and exact re-ranking.

mod clustering;
mod distance;
mod quantizer;
mod types;

pub use clustering::{DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE, KMeansConfig, KMeansResult, kmeans, nearest_centroid};
pub use distance::{Metric, dot, l2_squared};
pub use quantizer::{CODEBOOK_SIZE, ProductQuantizer};
pub use types::{ItemId, Slot, VectorDimension, VectorError};
