//! Embedding resolution boundary.
//!
//! Queries may arrive by item id rather than raw vector; something has to
//! map ids to embeddings. That capability is a trait so the serving path can
//! run against the loaded artifact's own vectors (the common case), an
//! external service, or a deterministic test double, without the engine
//! knowing the difference.
//!
//! Resolution is the only suspension point in the query path, so it is
//! always issued under a bounded timeout; a hung dependency becomes
//! [`ResolverError::Unavailable`] within the bound, never a hung request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::index::IndexArtifact;
use crate::vector::ItemId;

/// Errors from embedding resolution.
#[derive(Error, Debug, Clone)]
pub enum ResolverError {
    /// The id is not known to the resolver. Client-input error, surfaced
    /// verbatim and never retried.
    #[error("Unknown item id: '{0}'")]
    UnknownId(ItemId),

    /// Transient dependency failure; retried with backoff before being
    /// surfaced as service-unavailable.
    #[error("Embedding resolver unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Boxed resolution future, so the trait stays object-safe for handler state.
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<f32>, ResolverError>> + Send + 'a>>;

/// Maps a group of item ids to one embedding vector.
///
/// Aggregation across multiple ids is the resolver's contract, not the
/// engine's; the built-in [`StoreResolver`] averages.
pub trait EmbeddingResolver: Send + Sync {
    fn resolve<'a>(&'a self, ids: &'a [ItemId]) -> ResolverFuture<'a>;
}

/// Retry/timeout policy for resolver calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Bound on each individual resolve attempt.
    pub timeout: Duration,
    /// Retries after the first attempt (`Unavailable` only).
    pub max_retries: u32,
    /// Initial backoff; doubles per retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_retries: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Resolves `ids` with per-attempt timeout and bounded backoff retries.
///
/// `UnknownId` is returned immediately; only transient failures retry.
pub async fn resolve_with_retry(
    resolver: &dyn EmbeddingResolver,
    ids: &[ItemId],
    policy: &RetryPolicy,
) -> Result<Vec<f32>, ResolverError> {
    let mut backoff = policy.backoff;
    let mut last_reason = String::new();

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        match tokio::time::timeout(policy.timeout, resolver.resolve(ids)).await {
            Ok(Ok(embedding)) => return Ok(embedding),
            Ok(Err(ResolverError::UnknownId(id))) => return Err(ResolverError::UnknownId(id)),
            Ok(Err(ResolverError::Unavailable { reason })) => {
                tracing::warn!(attempt, %reason, "resolver unavailable");
                last_reason = reason;
            }
            Err(_) => {
                tracing::warn!(attempt, timeout_ms = policy.timeout.as_millis() as u64, "resolver timed out");
                last_reason = format!("timed out after {}ms", policy.timeout.as_millis());
            }
        }
    }

    Err(ResolverError::Unavailable {
        reason: format!(
            "gave up after {} attempts (last failure: {last_reason})",
            policy.max_retries + 1
        ),
    })
}

/// Resolver backed by the loaded artifact's own full-precision vectors.
///
/// Multi-id groups aggregate by element-wise mean. Purely in-memory, so it
/// completes immediately; the trait's async shape exists for external
/// implementations.
#[derive(Debug, Clone)]
pub struct StoreResolver {
    artifact: Arc<IndexArtifact>,
}

impl StoreResolver {
    #[must_use]
    pub fn new(artifact: Arc<IndexArtifact>) -> Self {
        Self { artifact }
    }
}

impl EmbeddingResolver for StoreResolver {
    fn resolve<'a>(&'a self, ids: &'a [ItemId]) -> ResolverFuture<'a> {
        Box::pin(async move {
            if ids.is_empty() {
                return Err(ResolverError::Unavailable {
                    reason: "no ids to resolve".to_string(),
                });
            }

            let dim = self.artifact.dimension().get();
            let mut sum = vec![0.0f32; dim];
            for id in ids {
                let slot = self
                    .artifact
                    .slot_of(id)
                    .ok_or_else(|| ResolverError::UnknownId(id.clone()))?;
                for (acc, &value) in sum.iter_mut().zip(self.artifact.store().vector(slot)) {
                    *acc += value;
                }
            }
            let count = ids.len() as f32;
            for value in &mut sum {
                *value /= count;
            }
            Ok(sum)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BuilderConfig, IndexBuilder};
    use crate::vector::{KMeansConfig, VectorDimension};

    fn test_artifact() -> Arc<IndexArtifact> {
        let items = vec![
            (ItemId::from("x"), vec![1.0, 0.0, 0.0, 0.0]),
            (ItemId::from("y"), vec![0.0, 1.0, 0.0, 0.0]),
            (ItemId::from("z"), vec![0.0, 0.0, 1.0, 0.0]),
        ];
        let builder = IndexBuilder::new(BuilderConfig {
            num_subspaces: 2,
            kmeans: KMeansConfig {
                seed: Some(3),
                ..KMeansConfig::default()
            },
            ..BuilderConfig::default()
        });
        Arc::new(
            builder
                .build(VectorDimension::new(4).unwrap(), items)
                .unwrap(),
        )
    }

    /// Always-failing resolver for retry tests.
    struct FlakyResolver {
        fail_first: std::sync::atomic::AtomicU32,
    }

    impl EmbeddingResolver for FlakyResolver {
        fn resolve<'a>(&'a self, _ids: &'a [ItemId]) -> ResolverFuture<'a> {
            Box::pin(async move {
                use std::sync::atomic::Ordering;
                if self.fail_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(1))
                }) != Ok(0)
                {
                    Err(ResolverError::Unavailable {
                        reason: "simulated outage".to_string(),
                    })
                } else {
                    Ok(vec![1.0, 2.0])
                }
            })
        }
    }

    /// Resolver that never completes, for timeout tests.
    struct HangingResolver;

    impl EmbeddingResolver for HangingResolver {
        fn resolve<'a>(&'a self, _ids: &'a [ItemId]) -> ResolverFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("the timeout must fire first")
            })
        }
    }

    #[tokio::test]
    async fn test_store_resolver_single_id() {
        let resolver = StoreResolver::new(test_artifact());
        let embedding = resolver.resolve(&[ItemId::from("y")]).await.unwrap();
        assert_eq!(embedding, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_store_resolver_mean_aggregation() {
        let resolver = StoreResolver::new(test_artifact());
        let embedding = resolver
            .resolve(&[ItemId::from("x"), ItemId::from("y")])
            .await
            .unwrap();
        assert_eq!(embedding, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_store_resolver_unknown_id() {
        let resolver = StoreResolver::new(test_artifact());
        let result = resolver.resolve(&[ItemId::from("ghost")]).await;
        assert!(matches!(result, Err(ResolverError::UnknownId(_))));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let resolver = FlakyResolver {
            fail_first: std::sync::atomic::AtomicU32::new(2),
        };
        let policy = RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 3,
            backoff: Duration::from_millis(1),
        };
        let ids = [ItemId::from("anything")];
        let embedding = resolve_with_retry(&resolver, &ids, &policy).await.unwrap();
        assert_eq!(embedding, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_unavailable() {
        let resolver = FlakyResolver {
            fail_first: std::sync::atomic::AtomicU32::new(100),
        };
        let policy = RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        let ids = [ItemId::from("anything")];
        let result = resolve_with_retry(&resolver, &ids, &policy).await;
        assert!(matches!(result, Err(ResolverError::Unavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_resolver_bounded_by_timeout() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 1,
            backoff: Duration::from_millis(10),
        };
        let ids = [ItemId::from("anything")];
        let result = resolve_with_retry(&HangingResolver, &ids, &policy).await;
        assert!(matches!(result, Err(ResolverError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_retried() {
        // UnknownId must surface immediately even with retries configured.
        let resolver = StoreResolver::new(test_artifact());
        let policy = RetryPolicy {
            max_retries: 5,
            ..RetryPolicy::default()
        };
        let ids = [ItemId::from("ghost")];
        let start = std::time::Instant::now();
        let result = resolve_with_retry(&resolver, &ids, &policy).await;
        assert!(matches!(result, Err(ResolverError::UnknownId(_))));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
