use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::api::{ClusterUpdate, ElbowResult, Session};
use crate::engine::EngineHandle;
use crate::error::{ClusterError, ErrorCode, SessionError};

use super::sse;

/// Shared application state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub handle: Arc<EngineHandle>,
}

/// HTTP error variants mapped to JSON responses.
#[derive(Debug)]
pub enum HttpServerError {
    NotFound(&'static str),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for HttpServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<SessionError> for HttpServerError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::DeviceBusy { .. } => HttpServerError::Conflict(err.message()),
            SessionError::NotFound { .. } => HttpServerError::NotFound("unknown session"),
            SessionError::DeviceUnreachable { .. } | SessionError::SpawnFailure { .. } => {
                HttpServerError::BadGateway(err.message())
            }
            _ => HttpServerError::Internal(err.message()),
        }
    }
}

impl From<ClusterError> for HttpServerError {
    fn from(err: ClusterError) -> Self {
        HttpServerError::BadRequest(err.message())
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OfflineSessionRequest {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterQuery {
    pub num_clusters: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterStreamQuery {
    pub num_clusters: Option<usize>,
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ElbowQuery {
    pub max_k: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SilhouetteQuery {
    pub k: Option<usize>,
}

/// Silhouette endpoint response payload.
#[derive(Debug, Serialize)]
pub struct SilhouetteResponse {
    pub k: usize,
    pub score: f64,
}

/// Build the Axum router with all handlers.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/offline", post(create_offline_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/stop", post(stop_session))
        .route("/api/sessions/:id/zones", get(latest_zones))
        .route("/api/sessions/:id/cluster", post(cluster_now))
        .route("/api/sessions/:id/analytics/elbow", get(elbow))
        .route("/api/sessions/:id/analytics/silhouette", get(silhouette))
        .route("/api/sessions/:id/stream/logs", get(stream_logs))
        .route("/api/sessions/:id/stream/packets", get(stream_packets))
        .route("/api/sessions/:id/stream/samples", get(stream_samples))
        .route("/api/sessions/:id/stream/clusters", get(stream_clusters))
        .with_state(state)
}

/// Run the HTTP server loop.
pub async fn run_http_server(state: HttpState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding HTTP listener")?;
    log::info!("[Http] Listening on {}", addr);
    let router = build_router(state);
    axum::serve(listener, router)
        .await
        .context("serving HTTP router")?;
    Ok(())
}

async fn list_devices(State(state): State<HttpState>) -> Result<Json<Vec<String>>, HttpServerError> {
    state
        .handle
        .list_devices()
        .await
        .map(Json)
        .map_err(|err| HttpServerError::BadGateway(err.message()))
}

async fn start_session(
    State(state): State<HttpState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<Session>, HttpServerError> {
    let session = state.handle.start_session(&request.device_id).await?;
    Ok(Json(session))
}

async fn stop_session(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<Json<Session>, HttpServerError> {
    state
        .handle
        .stop_session(id)
        .await
        .map(Json)
        .ok_or(HttpServerError::NotFound("unknown session"))
}

async fn get_session(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<Json<Session>, HttpServerError> {
    state
        .handle
        .session(id)
        .await
        .map(Json)
        .ok_or(HttpServerError::NotFound("unknown session"))
}

async fn list_sessions(
    State(state): State<HttpState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Session>> {
    Json(state.handle.recent_sessions(query.limit.unwrap_or(20)))
}

async fn create_offline_session(
    State(state): State<HttpState>,
    Json(request): Json<OfflineSessionRequest>,
) -> Result<Json<Session>, HttpServerError> {
    let session = state.handle.create_offline_session(&request.path).await?;
    Ok(Json(session))
}

/// Latest cluster update for a session; null when none was published yet.
async fn latest_zones(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<Json<Option<ClusterUpdate>>, HttpServerError> {
    if state.handle.session(id).await.is_none() {
        return Err(HttpServerError::NotFound("unknown session"));
    }
    Ok(Json(state.handle.latest_cluster_update(id)))
}

async fn cluster_now(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<Option<ClusterUpdate>>, HttpServerError> {
    let update = state.handle.cluster_now(id, query.num_clusters).await?;
    Ok(Json(update))
}

async fn elbow(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
    Query(query): Query<ElbowQuery>,
) -> Result<Json<ElbowResult>, HttpServerError> {
    let result = state
        .handle
        .elbow(id, query.max_k.unwrap_or(8))
        .await
        .ok_or(HttpServerError::NotFound("unknown session"))??;
    Ok(Json(result))
}

async fn silhouette(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
    Query(query): Query<SilhouetteQuery>,
) -> Result<Json<SilhouetteResponse>, HttpServerError> {
    let k = query.k.unwrap_or(4);
    let score = state
        .handle
        .silhouette(id, k)
        .await
        .ok_or(HttpServerError::NotFound("unknown session"))??;
    Ok(Json(SilhouetteResponse { k, score }))
}

async fn stream_logs(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<sse::EventStream, HttpServerError> {
    sse::logs(&state.handle, id)
}

async fn stream_packets(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<sse::EventStream, HttpServerError> {
    sse::packets(&state.handle, id)
}

async fn stream_samples(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<sse::EventStream, HttpServerError> {
    sse::samples(&state.handle, id)
}

async fn stream_clusters(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
    Query(query): Query<ClusterStreamQuery>,
) -> Result<sse::EventStream, HttpServerError> {
    sse::cluster_updates(
        &state.handle,
        id,
        query.num_clusters,
        query.interval_seconds.map(Duration::from_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use once_cell::sync::Lazy;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::AppConfig;

    static TEST_HANDLE: Lazy<Arc<EngineHandle>> =
        Lazy::new(|| Arc::new(EngineHandle::new(AppConfig::default())));

    fn make_router() -> Router {
        build_router(HttpState {
            handle: Arc::clone(&TEST_HANDLE),
        })
    }

    async fn response_json(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body bytes");
        let json = serde_json::from_slice::<Value>(&bytes).expect("JSON body");
        (status, json)
    }

    #[tokio::test]
    async fn test_sessions_list_starts_empty() {
        let (status, json) = response_json(
            make_router()
                .oneshot(
                    Request::builder()
                        .uri("/api/sessions")
                        .body(Body::empty())
                        .expect("list request"),
                )
                .await
                .expect("list call"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (status, json) = response_json(
            make_router()
                .oneshot(
                    Request::builder()
                        .uri("/api/sessions/123")
                        .body(Body::empty())
                        .expect("get request"),
                )
                .await
                .expect("get call"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "unknown session");
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_404() {
        let (status, _) = response_json(
            make_router()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/sessions/123/stop")
                        .body(Body::empty())
                        .expect("stop request"),
                )
                .await
                .expect("stop call"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_stream_for_unknown_session_is_404() {
        let response = make_router()
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/123/stream/logs")
                    .body(Body::empty())
                    .expect("stream request"),
            )
            .await
            .expect("stream call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_elbow_for_unknown_session_is_404() {
        let response = make_router()
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/123/analytics/elbow?max_k=6")
                    .body(Body::empty())
                    .expect("elbow request"),
            )
            .await
            .expect("elbow call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
