//! Two-stage approximate search over a loaded artifact.
//!
//! Coarse stage prunes to the `nprobe` nearest partitions; fine stage scores
//! every member of those partitions with ADC table lookups; re-ranking
//! recomputes exact distance for the top `k * over_fetch` candidates against
//! the full-precision store. Final ordering is always by exact distance with
//! ties broken by lower item id, so results are deterministic for a given
//! loaded artifact regardless of how the scan was scheduled.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::index::IndexArtifact;
use crate::vector::{ItemId, ProductQuantizer, Slot};

/// Default number of partitions probed per query.
pub const DEFAULT_NPROBE: usize = 8;

/// Default candidate over-fetch factor for re-ranking.
pub const DEFAULT_OVER_FETCH: usize = 4;

/// Search tunables; recall/latency knobs, not correctness knobs.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Partitions scanned per query (clamped to the partition count).
    pub nprobe: usize,
    /// The re-rank stage recomputes exact distance for `k * over_fetch`
    /// approximate candidates.
    pub over_fetch: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            nprobe: DEFAULT_NPROBE,
            over_fetch: DEFAULT_OVER_FETCH,
        }
    }
}

/// One ranked result: item id and its exact distance to the query
/// (smaller is closer, for both metrics).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: ItemId,
    pub distance: f32,
}

/// Errors surfaced to callers of [`QueryEngine::search`].
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl QueryError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }
}

/// Read-only search interface over one immutable [`IndexArtifact`].
///
/// Cheap to clone and share across request handlers; all state is behind
/// the `Arc`, and nothing is mutated after load.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    artifact: Arc<IndexArtifact>,
    config: SearchConfig,
}

impl QueryEngine {
    #[must_use]
    pub fn new(artifact: Arc<IndexArtifact>, config: SearchConfig) -> Self {
        Self { artifact, config }
    }

    /// The artifact this engine searches.
    #[must_use]
    pub fn artifact(&self) -> &Arc<IndexArtifact> {
        &self.artifact
    }

    /// Top-`k` nearest items to `query`.
    ///
    /// Fails with [`QueryError::InvalidQuery`] on `k == 0` or a dimension
    /// mismatch. An empty index yields an empty result, and `k` beyond the
    /// item count truncates to what exists; neither is an error.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, QueryError> {
        self.search_filtered(query, k, &HashSet::new())
    }

    /// [`QueryEngine::search`] with result exclusion: ids in `exclude` never
    /// appear in the result. Used for self-match filtering on id queries.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        exclude: &HashSet<ItemId>,
    ) -> Result<Vec<Neighbor>, QueryError> {
        if k == 0 {
            return Err(QueryError::invalid("result count k must be positive"));
        }
        self.artifact
            .dimension()
            .validate_vector(query)
            .map_err(|e| QueryError::invalid(e.to_string()))?;

        if self.artifact.item_count() == 0 {
            return Ok(Vec::new());
        }

        let metric = self.artifact.metric();

        // Coarse stage: nprobe nearest centroids. Sorting on
        // (distance, index) keeps ties deterministic.
        let p = self.artifact.partition_count();
        let nprobe = self.config.nprobe.clamp(1, p);
        let mut ranked_partitions: Vec<(f32, usize)> = (0..p)
            .map(|i| (metric.distance(query, self.artifact.centroid(i)), i))
            .collect();
        ranked_partitions
            .sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        ranked_partitions.truncate(nprobe);

        // Fine stage: ADC scan of the selected partitions. One dense table
        // per query; each candidate costs M lookups and no allocation.
        let table = self
            .artifact
            .quantizer()
            .distance_table(query, metric)
            .map_err(|e| QueryError::invalid(e.to_string()))?;

        let mut candidates: Vec<(f32, Slot)> = Vec::new();
        for &(_, partition) in &ranked_partitions {
            for &slot in self.artifact.partition_members(partition) {
                let approx = ProductQuantizer::adc_distance(&table, self.artifact.code(slot));
                candidates.push((approx, slot));
            }
        }

        // Keep k * over_fetch approximate front-runners for exact re-ranking.
        let keep = k.saturating_mul(self.config.over_fetch.max(1));
        if candidates.len() > keep {
            candidates
                .select_nth_unstable_by(keep - 1, |a, b| {
                    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1))
                });
            candidates.truncate(keep);
        }

        // Re-ranking: exact distance from the full-precision store.
        let store = self.artifact.store();
        let mut reranked: Vec<Neighbor> = candidates
            .into_iter()
            .map(|(_, slot)| Neighbor {
                id: self.artifact.item_id(slot).clone(),
                distance: metric.distance(query, store.vector(slot)),
            })
            .filter(|n| !exclude.contains(&n.id))
            .collect();
        reranked.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        reranked.truncate(k);

        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BuilderConfig, IndexBuilder};
    use crate::vector::{KMeansConfig, Metric, VectorDimension};

    /// 16 known 8-dimensional vectors in two natural clusters.
    fn two_cluster_engine() -> (QueryEngine, Vec<f32>, Vec<f32>) {
        let mut items = Vec::new();
        // Cluster A around (1, 0, ...): offsets grow with the index so the
        // nearest-to-centroid order is known exactly.
        for i in 0..8 {
            let mut v = vec![0.0f32; 8];
            v[0] = 1.0 + 0.01 * i as f32;
            items.push((ItemId::from(format!("a{i}")), v));
        }
        // Cluster B around (0, ..., 1).
        for i in 0..8 {
            let mut v = vec![0.0f32; 8];
            v[7] = 1.0 + 0.01 * i as f32;
            items.push((ItemId::from(format!("b{i}")), v));
        }

        let mut centroid_a = vec![0.0f32; 8];
        centroid_a[0] = 1.0;
        let mut centroid_b = vec![0.0f32; 8];
        centroid_b[7] = 1.0;

        let builder = IndexBuilder::new(BuilderConfig {
            metric: Metric::Euclidean,
            partitions: Some(2),
            num_subspaces: 4,
            kmeans: KMeansConfig {
                seed: Some(11),
                ..KMeansConfig::default()
            },
        });
        let artifact = builder
            .build(VectorDimension::new(8).unwrap(), items)
            .unwrap();
        (
            QueryEngine::new(Arc::new(artifact), SearchConfig::default()),
            centroid_a,
            centroid_b,
        )
    }

    #[test]
    fn test_centroid_query_returns_cluster_members() {
        let (engine, centroid_a, _) = two_cluster_engine();
        let results = engine.search(&centroid_a, 3).unwrap();
        assert_eq!(results.len(), 3);
        // a0, a1, a2 are the three items nearest the cluster-A centroid.
        let ids: Vec<&str> = results.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a0", "a1", "a2"]);
    }

    #[test]
    fn test_self_exclusion() {
        let (engine, centroid_a, _) = two_cluster_engine();
        let exclude: HashSet<ItemId> = [ItemId::from("a0")].into_iter().collect();
        let results = engine.search_filtered(&centroid_a, 3, &exclude).unwrap();
        let ids: Vec<&str> = results.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn test_results_sorted_and_unique() {
        let (engine, _, centroid_b) = two_cluster_engine();
        let results = engine.search(&centroid_b, 10).unwrap();
        assert!(results.len() <= 10);
        for pair in results.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        let unique: HashSet<&str> = results.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(unique.len(), results.len());
    }

    #[test]
    fn test_k_larger_than_collection_truncates() {
        let (engine, centroid_a, _) = two_cluster_engine();
        let results = engine.search(&centroid_a, 100).unwrap();
        assert!(results.len() <= 16);
        assert!(!results.is_empty());
    }

    #[test]
    fn test_invalid_queries() {
        let (engine, centroid_a, _) = two_cluster_engine();

        assert!(matches!(
            engine.search(&centroid_a, 0),
            Err(QueryError::InvalidQuery { .. })
        ));

        let wrong_dim = vec![1.0f32; 4];
        assert!(matches!(
            engine.search(&wrong_dim, 3),
            Err(QueryError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let builder = IndexBuilder::new(BuilderConfig {
            num_subspaces: 2,
            ..BuilderConfig::default()
        });
        let artifact = builder
            .build(VectorDimension::new(8).unwrap(), Vec::new())
            .unwrap();
        let engine = QueryEngine::new(Arc::new(artifact), SearchConfig::default());

        let results = engine.search(&vec![0.0; 8], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_repeated_queries_identical() {
        let (engine, centroid_a, _) = two_cluster_engine();
        let first = engine.search(&centroid_a, 8).unwrap();
        for _ in 0..5 {
            assert_eq!(engine.search(&centroid_a, 8).unwrap(), first);
        }
    }
}
