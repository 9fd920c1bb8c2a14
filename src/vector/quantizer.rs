//! Product quantization for compressed approximate distance scoring.
//!
//! An embedding of dimension D is split into M sub-vectors; each sub-vector
//! is replaced by the index of its nearest entry in a per-subspace codebook
//! trained with k-means. An item is then M bytes instead of 4*D, and query
//! distance is estimated with Asymmetric Distance Computation (ADC): one
//! table of per-subspace distances is computed per query, after which each
//! candidate costs M table lookups, no full-dimension arithmetic.

use crate::vector::clustering::{KMeansConfig, kmeans};
use crate::vector::distance::Metric;
use crate::vector::types::{VectorDimension, VectorError};
use rayon::prelude::*;

/// Codebook entries per subspace. Fixed at 256 so codes fit in a u8.
pub const CODEBOOK_SIZE: usize = 256;

/// Trained product quantizer: one `CODEBOOK_SIZE`-entry codebook per subspace.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    dimension: VectorDimension,
    num_subspaces: usize,
    sub_dimension: usize,
    /// Flat codebook: `codebook[s * CODEBOOK_SIZE * sub_dim + entry * sub_dim + d]`.
    codebook: Vec<f32>,
}

impl ProductQuantizer {
    /// Wraps an already-trained codebook, validating its shape.
    pub fn from_codebook(
        dimension: VectorDimension,
        num_subspaces: usize,
        codebook: Vec<f32>,
    ) -> Result<Self, VectorError> {
        if num_subspaces == 0 || dimension.get() % num_subspaces != 0 {
            return Err(VectorError::IndivisibleSubspaces {
                dimension: dimension.get(),
                subspaces: num_subspaces,
            });
        }
        let sub_dimension = dimension.get() / num_subspaces;
        let expected = num_subspaces * CODEBOOK_SIZE * sub_dimension;
        if codebook.len() != expected {
            return Err(VectorError::ClusteringFailed(format!(
                "codebook size mismatch: expected {expected} floats, got {}",
                codebook.len()
            )));
        }
        Ok(Self {
            dimension,
            num_subspaces,
            sub_dimension,
            codebook,
        })
    }

    /// Trains one codebook per subspace over the full item collection.
    ///
    /// When the collection has fewer than `CODEBOOK_SIZE` distinct sub-vectors
    /// the k-means run produces fewer centroids; the remaining codebook slots
    /// are filled by repeating the trained ones so that every u8 code stays
    /// addressable.
    pub fn train(
        vectors: &[&[f32]],
        dimension: VectorDimension,
        num_subspaces: usize,
        metric: Metric,
        kmeans_config: &KMeansConfig,
    ) -> Result<Self, VectorError> {
        if num_subspaces == 0 || dimension.get() % num_subspaces != 0 {
            return Err(VectorError::IndivisibleSubspaces {
                dimension: dimension.get(),
                subspaces: num_subspaces,
            });
        }
        if vectors.is_empty() {
            return Err(VectorError::ClusteringFailed(
                "cannot train quantizer on an empty collection".to_string(),
            ));
        }
        for v in vectors {
            dimension.validate_vector(v)?;
        }

        let sub_dim = dimension.get() / num_subspaces;
        let mut codebook = vec![0.0f32; num_subspaces * CODEBOOK_SIZE * sub_dim];

        // Each subspace trains independently on its slice of every vector.
        for s in 0..num_subspaces {
            let sub_vectors: Vec<&[f32]> = vectors
                .iter()
                .map(|v| &v[s * sub_dim..(s + 1) * sub_dim])
                .collect();

            let config = KMeansConfig {
                // Derive a distinct stream per subspace from the build seed.
                seed: kmeans_config.seed.map(|seed| seed.wrapping_add(s as u64)),
                ..kmeans_config.clone()
            };
            let result = kmeans(&sub_vectors, sub_dim, CODEBOOK_SIZE, metric, &config)?;

            let offset = s * CODEBOOK_SIZE * sub_dim;
            for entry in 0..CODEBOOK_SIZE {
                // Repeat trained centroids when k was clamped below 256.
                let src = (entry % result.k) * sub_dim;
                let dst = offset + entry * sub_dim;
                codebook[dst..dst + sub_dim].copy_from_slice(&result.centroids[src..src + sub_dim]);
            }
        }

        Ok(Self {
            dimension,
            num_subspaces,
            sub_dimension: sub_dim,
            codebook,
        })
    }

    /// Number of sub-vectors (code length in bytes).
    #[must_use]
    pub fn num_subspaces(&self) -> usize {
        self.num_subspaces
    }

    /// Dimension of each sub-vector.
    #[must_use]
    pub fn sub_dimension(&self) -> usize {
        self.sub_dimension
    }

    /// Full embedding dimension.
    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Flat codebook buffer (for artifact serialization).
    #[must_use]
    pub fn codebook(&self) -> &[f32] {
        &self.codebook
    }

    #[inline]
    fn entry(&self, subspace: usize, code: u8) -> &[f32] {
        let offset = (subspace * CODEBOOK_SIZE + code as usize) * self.sub_dimension;
        &self.codebook[offset..offset + self.sub_dimension]
    }

    /// Encodes one vector as M codebook indices.
    ///
    /// Each sub-vector maps to its nearest codebook entry under squared L2;
    /// ties break toward the lowest entry index.
    pub fn encode(&self, vector: &[f32], codes: &mut [u8]) -> Result<(), VectorError> {
        self.dimension.validate_vector(vector)?;
        debug_assert_eq!(codes.len(), self.num_subspaces);

        for s in 0..self.num_subspaces {
            let sub = &vector[s * self.sub_dimension..(s + 1) * self.sub_dimension];
            let mut best = 0u8;
            let mut best_dist = f32::MAX;
            for c in 0..CODEBOOK_SIZE {
                let dist = crate::vector::distance::l2_squared(sub, self.entry(s, c as u8));
                if dist < best_dist {
                    best_dist = dist;
                    best = c as u8;
                }
            }
            codes[s] = best;
        }
        Ok(())
    }

    /// Encodes a batch of vectors into one contiguous code buffer
    /// (`vectors.len() * M` bytes), parallelized across items.
    pub fn encode_batch(&self, vectors: &[&[f32]]) -> Result<Vec<u8>, VectorError> {
        for v in vectors {
            self.dimension.validate_vector(v)?;
        }
        let m = self.num_subspaces;
        let mut codes = vec![0u8; vectors.len() * m];
        codes
            .par_chunks_mut(m)
            .zip(vectors.par_iter())
            .try_for_each(|(chunk, vector)| self.encode(vector, chunk))?;
        Ok(codes)
    }

    /// Precomputes the ADC table for a query: `M * CODEBOOK_SIZE` sub-distances
    /// in one dense buffer, indexed `[subspace * CODEBOOK_SIZE + entry]`.
    ///
    /// Both metrics are additive over subspaces, so the per-item estimate is
    /// the sum of M lookups.
    pub fn distance_table(&self, query: &[f32], metric: Metric) -> Result<Vec<f32>, VectorError> {
        self.dimension.validate_vector(query)?;
        let mut table = vec![0.0f32; self.num_subspaces * CODEBOOK_SIZE];
        for s in 0..self.num_subspaces {
            let query_sub = &query[s * self.sub_dimension..(s + 1) * self.sub_dimension];
            let offset = s * CODEBOOK_SIZE;
            for c in 0..CODEBOOK_SIZE {
                table[offset + c] = metric.distance(query_sub, self.entry(s, c as u8));
            }
        }
        Ok(table)
    }

    /// ADC distance estimate for one code: M table lookups summed.
    ///
    /// Hot path; the table stays resident in L1 across a partition scan.
    #[inline]
    #[must_use]
    pub fn adc_distance(table: &[f32], codes: &[u8]) -> f32 {
        debug_assert_eq!(table.len(), codes.len() * CODEBOOK_SIZE);
        codes
            .iter()
            .enumerate()
            .map(|(s, &code)| table[s * CODEBOOK_SIZE + code as usize])
            .sum()
    }

    /// Reconstructs the approximate vector a code represents.
    #[must_use]
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        debug_assert_eq!(codes.len(), self.num_subspaces);
        let mut vector = Vec::with_capacity(self.dimension.get());
        for (s, &code) in codes.iter().enumerate() {
            vector.extend_from_slice(self.entry(s, code));
        }
        vector
    }
}
