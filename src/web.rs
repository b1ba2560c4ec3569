use crate::{
    catalog::{Gender, ImageRef},
    config::Config,
    embed::EmbedError,
    index::{GenerationStorage, StoreError},
    recommend::{Filters, RecommendError, Recommender, SearchRequest},
};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use tokio::signal;

struct SharedState {
    recommender: Arc<Recommender>,
    storage: GenerationStorage,
    space_id: [u8; 32],
}

async fn start_app(state: SharedState, config: &Config) {
    let shared_state = Arc::new(state);

    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {
                log::warn!("shutting down");
            },
            _ = terminate => {},
        }
    }

    let app = Router::new()
        .route("/api/recommend", post(recommend))
        .route("/api/reload", post(reload))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(config.server.max_body_mb * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state);

    let listen = config.server.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen).await.unwrap();
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

pub fn start_daemon(
    recommender: Arc<Recommender>,
    storage: GenerationStorage,
    space_id: [u8; 32],
    config: &Config,
) {
    let state = SharedState {
        recommender,
        storage,
        space_id,
    };
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(state, config).await });
}

// Make our own error that wraps `RecommendError`.
#[derive(Debug)]
struct HttpError(RecommendError);

// Tell axum how to convert `RecommendError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match &self.0 {
            RecommendError::InvalidRequest(_) => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            RecommendError::Embedding(EmbedError::Provider { .. }) => {
                log::error!("{self:?}");
                (
                    axum::http::StatusCode::SERVICE_UNAVAILABLE,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
            RecommendError::Store(StoreError::NotLoaded) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            _ => {
                log::error!("{self:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
        }
        .into_response()
    }
}

impl From<RecommendError> for HttpError {
    fn from(err: RecommendError) -> Self {
        Self(err)
    }
}

#[derive(Deserialize)]
pub struct RecommendRequest {
    /// Free-text query
    pub q: Option<String>,

    /// Base64-encoded query image, with or without a data-URL prefix
    pub image_base64: Option<String>,

    pub top_k: Option<usize>,

    /// Apply the cross-encoder stage when available
    #[serde(default)]
    pub rerank: bool,

    /// Explicit gender filter: "men", "women" or "unisex"
    pub gender_filter: Option<String>,

    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_rating: Option<f64>,
}

impl Debug for RecommendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RecommendRequest {{ q: {:?}, image_base64: {}, top_k: {:?}, rerank: {:?}, gender_filter: {:?}, min_price: {:?}, max_price: {:?}, min_rating: {:?} }}",
            self.q,
            if self.image_base64.is_some() { "[REDUCTED]" } else { "None" },
            self.top_k,
            self.rerank,
            self.gender_filter,
            self.min_price,
            self.max_price,
            self.min_rating,
        )
    }
}

#[derive(Serialize)]
pub struct ResultItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    pub score: f32,
    pub rank: usize,
    /// Original unmodified source record
    pub raw: serde_json::Value,
}

#[derive(Serialize)]
pub struct RecommendResponse {
    pub results: Vec<ResultItem>,
    /// Embedding provider that produced the query vector
    pub provider: String,
    /// Whether cross-encoder ordering actually applied
    pub reranked: bool,
}

fn parse_gender(raw: &str) -> Result<Gender, HttpError> {
    raw.parse::<Gender>()
        .map_err(|err| HttpError(RecommendError::InvalidRequest(err)))
}

fn decode_image(raw: &str) -> Result<Vec<u8>, HttpError> {
    // strip a data-URL prefix if present
    let payload = match raw.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => raw,
    };
    STANDARD.decode(payload.trim()).map_err(|err| {
        HttpError(RecommendError::InvalidRequest(format!(
            "image_base64 is not valid base64: {err}"
        )))
    })
}

async fn recommend(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RecommendRequest>,
) -> Result<axum::Json<RecommendResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let gender = payload
        .gender_filter
        .as_deref()
        .map(parse_gender)
        .transpose()?;
    let query_image = payload
        .image_base64
        .as_deref()
        .map(decode_image)
        .transpose()?;

    let request = SearchRequest {
        query_text: payload.q,
        query_image,
        top_k: payload.top_k,
        rerank: payload.rerank,
        filters: Filters {
            gender,
            min_price: payload.min_price,
            max_price: payload.max_price,
            min_rating: payload.min_rating,
        },
    };

    let recommender = state.recommender.clone();
    tokio::task::block_in_place(move || {
        let recommendation = recommender.recommend(&request)?;

        let results = recommendation
            .results
            .into_iter()
            .map(|r| ResultItem {
                id: r.product.id,
                title: r.product.title,
                price: r.product.price,
                rating: r.product.rating,
                gender: r.product.gender,
                images: r.product.image_refs,
                score: r.score,
                rank: r.rank,
                raw: r.product.raw,
            })
            .collect();

        Ok(Json(RecommendResponse {
            results,
            provider: recommendation.provider,
            reranked: recommendation.reranked,
        }))
    })
}

/// Reload the persisted generation and swap it in without restarting.
async fn reload(
    State(state): State<Arc<SharedState>>,
) -> Result<axum::Json<serde_json::Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let generation = state
            .recommender
            .store()
            .load_from(&state.storage, &state.space_id)
            .map_err(RecommendError::Store)?;

        Ok(Json(json!({
            "products": generation.len(),
            "built_at": generation.built_at().to_rfc3339(),
        })))
    })
}

async fn health(State(state): State<Arc<SharedState>>) -> axum::Json<serde_json::Value> {
    let loaded = state.recommender.store().is_loaded();
    Json(json!({ "status": "ok", "index_loaded": loaded }))
}
