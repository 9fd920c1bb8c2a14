//! Offline index construction: coarse partitioning plus quantization.
//!
//! The builder consumes the full item collection and produces a validated
//! [`IndexArtifact`]. Builds are offline and cold-path; serving never
//! mutates the result. Two builds over identical input are not guaranteed
//! to produce identical artifacts unless a seed is set; retrieval quality
//! is the contract, not byte equality.

use std::collections::HashSet;

use thiserror::Error;

use crate::index::artifact::{ARTIFACT_VERSION, ArtifactError, IndexArtifact, Manifest};
use crate::store::{StoreError, VectorStore};
use crate::vector::{
    CODEBOOK_SIZE, ItemId, KMeansConfig, Metric, ProductQuantizer, Slot, VectorDimension,
    VectorError, kmeans,
};

/// Default sub-vector count when the configuration does not set one.
pub const DEFAULT_NUM_SUBSPACES: usize = 8;

/// Errors raised during index construction.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Duplicate item id '{0}' in input\nSuggestion: Item ids must be unique within a collection")]
    DuplicateId(ItemId),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Build parameters.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Distance metric baked into the artifact.
    pub metric: Metric,
    /// Partition count P; `None` derives ceil(sqrt(N)), which balances
    /// partition scan cost against recall.
    pub partitions: Option<usize>,
    /// Sub-vector count M; must divide the embedding dimension.
    pub num_subspaces: usize,
    /// Clustering bounds shared by partitioning and codebook training.
    pub kmeans: KMeansConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            partitions: None,
            num_subspaces: DEFAULT_NUM_SUBSPACES,
            kmeans: KMeansConfig::default(),
        }
    }
}

/// Builds [`IndexArtifact`]s from item collections.
#[derive(Debug, Clone, Default)]
pub struct IndexBuilder {
    config: BuilderConfig,
}

impl IndexBuilder {
    #[must_use]
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Builds an artifact over the full collection.
    ///
    /// Slot order follows input order. Every item is assigned to exactly one
    /// partition (nearest centroid, ties to the lowest centroid index);
    /// partitions left empty after clustering are dropped, their centroids
    /// removed.
    pub fn build(
        &self,
        dimension: VectorDimension,
        items: Vec<(ItemId, Vec<f32>)>,
    ) -> Result<IndexArtifact, BuildError> {
        if items.is_empty() {
            return self.build_empty(dimension);
        }

        let mut seen = HashSet::with_capacity(items.len());
        for (id, embedding) in &items {
            dimension.validate_vector(embedding)?;
            if !seen.insert(id.clone()) {
                return Err(BuildError::DuplicateId(id.clone()));
            }
        }

        let n = items.len();
        let requested_p = self
            .config
            .partitions
            .unwrap_or_else(|| (n as f64).sqrt().ceil() as usize)
            .clamp(1, n);

        tracing::info!(
            items = n,
            partitions = requested_p,
            subspaces = self.config.num_subspaces,
            metric = %self.config.metric,
            "building index"
        );

        let embeddings: Vec<&[f32]> = items.iter().map(|(_, v)| v.as_slice()).collect();

        // Coarse stage: partition the collection.
        let clustering = kmeans(
            &embeddings,
            dimension.get(),
            requested_p,
            self.config.metric,
            &self.config.kmeans,
        )?;

        // Gather memberships, then drop partitions nothing was assigned to.
        let mut memberships: Vec<Vec<Slot>> = vec![Vec::new(); clustering.k];
        for (slot, &assignment) in clustering.assignments.iter().enumerate() {
            memberships[assignment as usize].push(Slot::new(slot as u32));
        }
        let d = dimension.get();
        let mut centroids = Vec::with_capacity(clustering.k * d);
        let mut partitions = Vec::with_capacity(clustering.k);
        let mut dropped = 0usize;
        for (c, members) in memberships.into_iter().enumerate() {
            if members.is_empty() {
                dropped += 1;
                continue;
            }
            centroids.extend_from_slice(&clustering.centroids[c * d..(c + 1) * d]);
            partitions.push(members);
        }
        if dropped > 0 {
            tracing::debug!(dropped, "dropped empty partitions");
        }

        // Fine stage: train the quantizer and encode every item.
        let quantizer = ProductQuantizer::train(
            &embeddings,
            dimension,
            self.config.num_subspaces,
            self.config.metric,
            &self.config.kmeans,
        )?;
        let codes = quantizer.encode_batch(&embeddings)?;

        let mut flat = Vec::with_capacity(n * d);
        let mut id_map = Vec::with_capacity(n);
        for (id, embedding) in items {
            flat.extend_from_slice(&embedding);
            id_map.push(id);
        }
        let store = VectorStore::from_flat(dimension, flat)?;

        let manifest = Manifest {
            version: ARTIFACT_VERSION,
            dimension,
            metric: self.config.metric,
            item_count: n,
            partition_count: partitions.len(),
            num_subspaces: self.config.num_subspaces,
            codebook_size: CODEBOOK_SIZE,
        };

        Ok(IndexArtifact::new(
            manifest, centroids, quantizer, codes, id_map, partitions, store,
        )?)
    }

    /// An artifact over zero items: searches return empty results rather
    /// than erroring, so an empty collection is a legal build input.
    fn build_empty(&self, dimension: VectorDimension) -> Result<IndexArtifact, BuildError> {
        let m = self.config.num_subspaces;
        if m == 0 || dimension.get() % m != 0 {
            return Err(BuildError::Vector(VectorError::IndivisibleSubspaces {
                dimension: dimension.get(),
                subspaces: m,
            }));
        }
        let sub_dim = dimension.get() / m;
        let quantizer = ProductQuantizer::from_codebook(
            dimension,
            m,
            vec![0.0f32; m * CODEBOOK_SIZE * sub_dim],
        )?;
        let store = VectorStore::from_flat(dimension, Vec::new())?;
        let manifest = Manifest {
            version: ARTIFACT_VERSION,
            dimension,
            metric: self.config.metric,
            item_count: 0,
            partition_count: 0,
            num_subspaces: m,
            codebook_size: CODEBOOK_SIZE,
        };
        Ok(IndexArtifact::new(
            manifest,
            Vec::new(),
            quantizer,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            store,
        )?)
    }
}
