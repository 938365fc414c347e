//! HTTP control interface
//!
//! Serves a small JSON API on the loopback interface for operators and the
//! scheduler's front-ends:
//!
//! - `POST /sync/full`, `POST /sync/incremental`: start a session
//! - `GET  /sessions/{id}`, `POST /sessions/{id}/cancel`
//! - `GET  /conflicts?status=...`, `POST /conflicts/{id}/resolve`
//! - `GET  /entities/{id}/health`: revenue-phase score for one record
//! - `GET  /progress`: long-poll for the next progress event
//! - `GET  /status`: overall sync health
//!
//! One task per connection; the accept loop stops when the shutdown token
//! fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pipesync_conflict::resolver::ConflictResolver;
use pipesync_core::domain::conflict::{ResolutionStatus, ResolutionStrategy};
use pipesync_core::domain::newtypes::{ConflictId, RemoteRecordId, SessionId};
use pipesync_core::domain::scoring::health_score;
use pipesync_core::domain::session::SessionKind;
use pipesync_core::ports::state_repository::{ConflictFilter, IStateRepository};
use pipesync_engine::status::{status_report, SessionSummary};
use pipesync_engine::{EngineError, SyncOrchestrator};

/// How long `/progress` waits for the next event before returning 204
const PROGRESS_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handles the request handlers operate on
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    pub resolver: ConflictResolver,
    pub repository: Arc<dyn IStateRepository + Send + Sync>,
}

/// HTTP server for the control interface
pub struct ControlServer {
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl ControlServer {
    pub fn new(state: Arc<AppState>, listen_addr: &str) -> anyhow::Result<Self> {
        let addr: SocketAddr = listen_addr.parse()?;
        Ok(Self { state, addr })
    }

    /// Runs the accept loop until the shutdown token fires
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "control interface listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result?;
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move {
                                Ok::<_, std::convert::Infallible>(route(req, state).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!(error = %e, "control connection error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("control interface shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Dispatches one request to its handler
async fn route<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let query = req.uri().query().map(str::to_string);
    let segments: Vec<&str> = path.split('/').collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["status"]) => get_status(&state).await,
        ("POST", ["sync", "full"]) => start_sync(&state, SessionKind::Full).await,
        ("POST", ["sync", "incremental"]) => {
            start_sync(&state, SessionKind::Incremental).await
        }
        ("GET", ["sessions", id]) => get_session(&state, id).await,
        ("POST", ["sessions", id, "cancel"]) => cancel_session(&state, id).await,
        ("GET", ["conflicts"]) => list_conflicts(&state, query.as_deref()).await,
        ("POST", ["conflicts", id, "resolve"]) => {
            let id = id.to_string();
            let body = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        &format!("failed to read request body: {e}"),
                    )
                }
            };
            resolve_conflict(&state, &id, &body).await
        }
        ("GET", ["entities", id, "health"]) => entity_health(&state, id).await,
        ("GET", ["progress"]) => next_progress(&state).await,
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_status(state: &AppState) -> Response<Full<Bytes>> {
    match status_report(state.repository.as_ref()).await {
        Ok(report) => json_response(StatusCode::OK, &report),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

async fn start_sync(state: &AppState, kind: SessionKind) -> Response<Full<Bytes>> {
    let result = match kind {
        SessionKind::Full => state.orchestrator.start_full().await,
        SessionKind::Incremental => state.orchestrator.start_incremental().await,
    };
    match result {
        Ok(session_id) => json_response(
            StatusCode::ACCEPTED,
            &serde_json::json!({ "session_id": session_id }),
        ),
        Err(EngineError::AlreadyRunning(session_id)) => json_response(
            StatusCode::CONFLICT,
            &serde_json::json!({
                "error": "a sync session is already active",
                "session_id": session_id,
            }),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e}")),
    }
}

async fn get_session(state: &AppState, raw_id: &str) -> Response<Full<Bytes>> {
    let Ok(id) = raw_id.parse::<SessionId>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid session id");
    };
    match state.repository.get_session(&id).await {
        Ok(Some(session)) => json_response(StatusCode::OK, &SessionSummary::from(&session)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

async fn cancel_session(state: &AppState, raw_id: &str) -> Response<Full<Bytes>> {
    let Ok(id) = raw_id.parse::<SessionId>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid session id");
    };
    match state.orchestrator.cancel(&id).await {
        Ok(()) => json_response(
            StatusCode::ACCEPTED,
            &serde_json::json!({ "status": "cancelling" }),
        ),
        Err(EngineError::SessionNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "session not found")
        }
        Err(EngineError::NotActive { status, .. }) => error_response(
            StatusCode::CONFLICT,
            &format!("session is not active (status: {status})"),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e}")),
    }
}

async fn list_conflicts(state: &AppState, query: Option<&str>) -> Response<Full<Bytes>> {
    let query = query.unwrap_or("");
    let mut filter = ConflictFilter::default();
    if let Some(status) = query_param(query, "status") {
        match parse_resolution_status(&status) {
            Some(parsed) => filter.resolution_status = Some(parsed),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown resolution status: {status}"),
                )
            }
        }
    }
    if let Some(limit) = query_param(query, "limit") {
        match limit.parse::<u32>() {
            Ok(parsed) => filter.limit = Some(parsed),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid limit: {limit}"),
                )
            }
        }
    }
    match state.repository.list_conflicts(&filter).await {
        Ok(conflicts) => json_response(StatusCode::OK, &conflicts),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

/// Body of `POST /conflicts/{id}/resolve`
///
/// `{"strategy": "remote_wins"}`, `{"strategy": "local_wins"}`, or
/// `{"strategy": "merged", "values": {...}}`, optionally with `resolved_by`.
#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(flatten)]
    strategy: ResolutionStrategy,
    resolved_by: Option<String>,
}

async fn resolve_conflict(state: &AppState, raw_id: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let Ok(id) = raw_id.parse::<ConflictId>() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid conflict id");
    };
    let request: ResolveRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}"))
        }
    };
    let resolved_by = request.resolved_by.as_deref().unwrap_or("operator");

    use pipesync_conflict::error::ConflictError;
    match state
        .resolver
        .apply_resolution(&id, request.strategy, resolved_by)
        .await
    {
        Ok(conflict) => json_response(StatusCode::OK, &conflict),
        Err(e @ ConflictError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, &format!("{e}"))
        }
        Err(e @ ConflictError::EntityNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, &format!("{e}"))
        }
        Err(e @ ConflictError::AlreadyResolved(_)) => {
            error_response(StatusCode::CONFLICT, &format!("{e}"))
        }
        Err(e @ ConflictError::ResolutionFailed(_)) => {
            error_response(StatusCode::BAD_GATEWAY, &format!("{e}"))
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, &format!("{e}")),
    }
}

async fn entity_health(state: &AppState, raw_id: &str) -> Response<Full<Bytes>> {
    let Ok(id) = RemoteRecordId::new(raw_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid record id");
    };
    match state.repository.get_entity(&id).await {
        Ok(Some(entity)) => {
            json_response(StatusCode::OK, &health_score(&entity, chrono::Utc::now()))
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "record not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e:#}")),
    }
}

/// Long-polls for the next progress event
async fn next_progress(state: &AppState) -> Response<Full<Bytes>> {
    let mut rx = state.orchestrator.subscribe();
    match tokio::time::timeout(PROGRESS_POLL_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                // Lagged: skip to the most recent events
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    {
        Ok(Some(event)) => json_response(StatusCode::OK, &event),
        _ => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn parse_resolution_status(raw: &str) -> Option<ResolutionStatus> {
    match raw {
        "unresolved" => Some(ResolutionStatus::Unresolved),
        "resolved_local" => Some(ResolutionStatus::ResolvedLocal),
        "resolved_remote" => Some(ResolutionStatus::ResolvedRemote),
        "resolved_merged" => Some(ResolutionStatus::ResolvedMerged),
        _ => None,
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{e}")),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
