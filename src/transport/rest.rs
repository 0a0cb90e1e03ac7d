//! Administrative HTTP API.
//!
//! Routes:
//! - `POST /topics` creates a topic from `{"name": ...}`
//! - `GET /topics` lists topics sorted by name
//! - `DELETE /topics/:name` removes a topic and its history
//! - `GET /topics/:name/recent?n=` returns replay history, oldest first
//! - `GET /health` liveness, never authenticated
//! - `GET /stats` broker counters
//!
//! When an API key is configured every route except `/health` requires it
//! in the `X-API-Key` header.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::broker::{BrokerHandle, Envelope, TopicInfo};
use crate::config::SecuritySettings;
use crate::utils::error::{ServerError, TopicError};

#[derive(Clone)]
pub struct AdminState {
    pub broker: BrokerHandle,
    pub security: Arc<SecuritySettings>,
}

impl AdminState {
    pub fn new(broker: BrokerHandle, security: SecuritySettings) -> Self {
        Self {
            broker,
            security: Arc::new(security),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// JSON error with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<TopicError> for ApiError {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::AlreadyExists(_) => {
                ApiError::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            TopicError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
        }
    }
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if state.security.key_matches(presented) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Invalid or missing API key",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTopicRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicStatus {
    pub status: String,
    pub topic: String,
}

#[derive(Debug, Serialize)]
pub struct TopicList {
    pub topics: Vec<TopicInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentMessages {
    pub topic: String,
    pub messages: Vec<Envelope>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicStats {
    pub messages: u64,
    pub subscribers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_clients: usize,
    pub total_topics: usize,
    pub total_messages: u64,
    pub active_topics: usize,
    pub uptime_sec: u64,
    pub topics: BTreeMap<String, TopicStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_sec: u64,
    pub topics: usize,
    pub subscribers: usize,
}

async fn create_topic(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<CreateTopicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Topic name is required",
        ));
    }
    state.broker.create_topic(name)?;
    Ok((
        StatusCode::CREATED,
        Json(TopicStatus {
            status: "created".to_string(),
            topic: name.to_string(),
        }),
    ))
}

async fn delete_topic(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<TopicStatus>, ApiError> {
    authorize(&state, &headers)?;
    state.broker.delete_topic(&name)?;
    Ok(Json(TopicStatus {
        status: "deleted".to_string(),
        topic: name,
    }))
}

async fn list_topics(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<TopicList>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(TopicList {
        topics: state.broker.list_topics(),
    }))
}

async fn recent_messages(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentMessages>, ApiError> {
    authorize(&state, &headers)?;
    let messages = state
        .broker
        .recent(&name, query.n.unwrap_or(0))
        .iter()
        .map(|envelope| envelope.as_ref().clone())
        .collect();
    Ok(Json(RecentMessages {
        topic: name,
        messages,
    }))
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let stats = state.broker.get_stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_sec: stats.uptime.as_secs(),
        topics: stats.total_topics,
        subscribers: stats.total_clients,
    })
}

async fn stats(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ApiError> {
    authorize(&state, &headers)?;
    let stats = state.broker.get_stats();
    let topics = state
        .broker
        .list_topics()
        .into_iter()
        .map(|topic| {
            let per_topic = TopicStats {
                messages: topic.message_count,
                subscribers: topic.subscriber_count,
            };
            (topic.name, per_topic)
        })
        .collect();
    Ok(Json(StatsResponse {
        total_clients: stats.total_clients,
        total_topics: stats.total_topics,
        total_messages: stats.total_messages,
        active_topics: stats.active_topics,
        uptime_sec: stats.uptime.as_secs(),
        topics,
    }))
}

pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/topics", get(list_topics).post(create_topic))
        .route("/topics/:name", delete(delete_topic))
        .route("/topics/:name/recent", get(recent_messages))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn start_admin_server(addr: &str, state: AdminState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!("admin API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
