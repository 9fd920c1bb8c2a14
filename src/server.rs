//! HTTP serving facade.
//!
//! Two routes: `GET /health` (ready only once an artifact is loaded and
//! validated) and `POST /predict`. All business logic lives in the engine
//! and resolver; this layer validates request shape, dispatches, and shapes
//! responses. Errors become `{"error": ...}` bodies with a non-2xx status;
//! a failed request never takes the process down.
//!
//! The loaded index is shared as `Arc<RwLock<Option<Arc<ServingIndex>>>>`.
//! The artifact itself is immutable, so request handlers only clone the
//! inner `Arc` under a momentary read lock; installing a rebuilt artifact
//! is a pointer swap, and in-flight requests finish against whichever
//! artifact they started with.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::{QueryEngine, SearchConfig};
use crate::error::EngineError;
use crate::index::IndexArtifact;
use crate::resolver::{EmbeddingResolver, RetryPolicy, StoreResolver, resolve_with_retry};
use crate::vector::ItemId;

/// Serving-time knobs derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub retry: RetryPolicy,
    pub search: SearchConfig,
    /// Result count used when an instance does not set `show`.
    pub default_show: usize,
    /// Whole-request deadline.
    pub request_timeout: Duration,
}

impl From<&Settings> for ServeOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            retry: settings.retry_policy(),
            search: settings.search_config(),
            default_show: settings.server.default_show,
            request_timeout: Duration::from_millis(settings.server.request_timeout_ms),
        }
    }
}

/// One loaded, immutable index plus the resolver bound to it.
pub struct ServingIndex {
    pub engine: QueryEngine,
    pub resolver: Arc<dyn EmbeddingResolver>,
}

impl ServingIndex {
    /// Wires an artifact to an engine and its store-backed resolver.
    #[must_use]
    pub fn from_artifact(artifact: Arc<IndexArtifact>, search: SearchConfig) -> Self {
        Self {
            engine: QueryEngine::new(Arc::clone(&artifact), search),
            resolver: Arc::new(StoreResolver::new(artifact)),
        }
    }
}

/// Shared handler state. Cloning is cheap; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    index: Arc<RwLock<Option<Arc<ServingIndex>>>>,
    options: Arc<ServeOptions>,
}

impl AppState {
    /// State with no index loaded; `/health` reports not-ready.
    #[must_use]
    pub fn empty(options: ServeOptions) -> Self {
        Self {
            index: Arc::new(RwLock::new(None)),
            options: Arc::new(options),
        }
    }

    /// Atomically installs `index`, replacing any previous one. In-flight
    /// requests keep the artifact they already resolved.
    pub fn install(&self, index: ServingIndex) {
        *self.index.write() = Some(Arc::new(index));
    }

    fn current(&self) -> Option<Arc<ServingIndex>> {
        self.index.read().clone()
    }
}

/// One entry of the `instances` array.
///
/// An object requests ANN matching; a bare string requests embedding
/// lookup for its (space-separated) ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Instance {
    Match {
        /// Space-separated item ids; mutually optional with `vector`.
        query: Option<String>,
        /// Raw query embedding, bypassing the resolver.
        vector: Option<Vec<f32>>,
        /// Result count; defaults to the server's configured value.
        show: Option<usize>,
        /// Drop the queried ids themselves from the result.
        #[serde(default)]
        exclude_self: bool,
    },
    Lookup(String),
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    instances: Vec<Instance>,
}

/// Builds the application router. Exposed separately from [`serve`] so
/// tests can drive it without a socket.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .with_state(state)
}

/// Binds `bind` and serves until ctrl-c or `shutdown` fires.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving");

    let server = axum::serve(listener, router(state));
    tokio::select! {
        result = server => {
            result?;
        }
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    }
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.current() {
        Some(index) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "items": index.engine.artifact().item_count(),
            })),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready"})),
        )
            .into_response(),
    }
}

async fn predict(
    State(state): State<AppState>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(&EngineError::InvalidRequest {
                reason: rejection.body_text(),
            });
        }
    };

    let Some(index) = state.current() else {
        return error_response(&EngineError::NotReady);
    };

    let timeout = state.options.request_timeout;
    let work = handle_instances(&index, &state.options, request);
    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(predictions)) => (StatusCode::OK, Json(json!({"predictions": predictions}))).into_response(),
        Ok(Err(error)) => error_response(&error),
        Err(_) => error_response(&EngineError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    }
}

/// Processes instances in order; one output entry per input entry.
async fn handle_instances(
    index: &ServingIndex,
    options: &ServeOptions,
    request: PredictRequest,
) -> Result<Vec<Value>, EngineError> {
    if request.instances.is_empty() {
        return Err(EngineError::InvalidRequest {
            reason: "instances must be non-empty".to_string(),
        });
    }

    let mut predictions = Vec::with_capacity(request.instances.len());
    for instance in request.instances {
        predictions.push(handle_instance(index, options, instance).await?);
    }
    Ok(predictions)
}

async fn handle_instance(
    index: &ServingIndex,
    options: &ServeOptions,
    instance: Instance,
) -> Result<Value, EngineError> {
    match instance {
        Instance::Lookup(query) => {
            let ids = parse_ids(&query)?;
            let embedding = resolve_with_retry(index.resolver.as_ref(), &ids, &options.retry).await?;
            Ok(json!(embedding))
        }
        Instance::Match {
            query,
            vector,
            show,
            exclude_self,
        } => {
            let k = show.unwrap_or(options.default_show);
            if k == 0 {
                return Err(EngineError::InvalidRequest {
                    reason: "show must be positive".to_string(),
                });
            }

            let (embedding, queried_ids) = match (vector, query) {
                (Some(vector), _) => (vector, Vec::new()),
                (None, Some(query)) => {
                    let ids = parse_ids(&query)?;
                    let embedding =
                        resolve_with_retry(index.resolver.as_ref(), &ids, &options.retry).await?;
                    (embedding, ids)
                }
                (None, None) => {
                    return Err(EngineError::InvalidRequest {
                        reason: "instance needs either 'query' or 'vector'".to_string(),
                    });
                }
            };

            let neighbors = if exclude_self && !queried_ids.is_empty() {
                let exclude = queried_ids.into_iter().collect();
                index.engine.search_filtered(&embedding, k, &exclude)?
            } else {
                index.engine.search(&embedding, k)?
            };

            let ids: Vec<&str> = neighbors.iter().map(|n| n.id.as_str()).collect();
            Ok(json!(ids))
        }
    }
}

fn parse_ids(query: &str) -> Result<Vec<ItemId>, EngineError> {
    let ids: Vec<ItemId> = query.split_whitespace().map(ItemId::from).collect();
    if ids.is_empty() {
        return Err(EngineError::InvalidRequest {
            reason: "query must contain at least one item id".to_string(),
        });
    }
    Ok(ids)
}

fn error_response(error: &EngineError) -> Response {
    let status = StatusCode::from_u16(error.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(code = %error.status_code(), "request failed: {error}");
    } else {
        tracing::debug!(code = %error.status_code(), "request rejected: {error}");
    }
    (
        status,
        Json(json!({
            "error": error.to_string(),
            "code": error.status_code(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BuilderConfig, IndexBuilder};
    use crate::vector::{KMeansConfig, VectorDimension};

    fn ready_state() -> AppState {
        let mut items = Vec::new();
        for i in 0..8 {
            let mut v = vec![0.0f32; 4];
            v[0] = 1.0 + 0.01 * i as f32;
            items.push((ItemId::from(format!("a{i}")), v));
        }
        let builder = IndexBuilder::new(BuilderConfig {
            partitions: Some(2),
            num_subspaces: 2,
            kmeans: KMeansConfig {
                seed: Some(5),
                ..KMeansConfig::default()
            },
            ..BuilderConfig::default()
        });
        let artifact = builder
            .build(VectorDimension::new(4).unwrap(), items)
            .unwrap();

        let options = ServeOptions::from(&Settings::default());
        let state = AppState::empty(options.clone());
        state.install(ServingIndex::from_artifact(
            Arc::new(artifact),
            options.search,
        ));
        state
    }

    #[tokio::test]
    async fn test_instances_preserve_input_order() {
        let state = ready_state();
        let index = state.current().unwrap();
        let request = PredictRequest {
            instances: vec![
                Instance::Match {
                    query: Some("a0".to_string()),
                    vector: None,
                    show: Some(2),
                    exclude_self: false,
                },
                Instance::Lookup("a1".to_string()),
            ],
        };
        let predictions = handle_instances(&index, &state.options, request)
            .await
            .unwrap();
        assert_eq!(predictions.len(), 2);
        assert!(predictions[0].is_array());
        // Second entry is the raw embedding of a1.
        assert_eq!(predictions[1][0].as_f64().unwrap() as f32, 1.01);
    }

    #[tokio::test]
    async fn test_empty_instances_rejected() {
        let state = ready_state();
        let index = state.current().unwrap();
        let request = PredictRequest { instances: vec![] };
        let result = handle_instances(&index, &state.options, request).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_instance_without_query_or_vector_rejected() {
        let state = ready_state();
        let index = state.current().unwrap();
        let instance = Instance::Match {
            query: None,
            vector: None,
            show: Some(3),
            exclude_self: false,
        };
        let result = handle_instance(&index, &state.options, instance).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_unknown_id_surfaces_as_client_error() {
        let state = ready_state();
        let index = state.current().unwrap();
        let instance = Instance::Lookup("nope".to_string());
        let error = handle_instance(&index, &state.options, instance)
            .await
            .unwrap_err();
        assert_eq!(error.http_status(), 400);
    }

    #[test]
    fn test_instance_deserialization_forms() {
        let object: Instance = serde_json::from_str(r#"{"query": "a b", "show": 5}"#).unwrap();
        assert!(matches!(object, Instance::Match { show: Some(5), .. }));

        let bare: Instance = serde_json::from_str(r#""a b c""#).unwrap();
        assert!(matches!(bare, Instance::Lookup(_)));

        let raw: Instance =
            serde_json::from_str(r#"{"vector": [0.1, 0.2], "exclude_self": true}"#).unwrap();
        assert!(matches!(
            raw,
            Instance::Match {
                vector: Some(_),
                exclude_self: true,
                ..
            }
        ));
    }
}
