//! Route handlers for the flow API.
//!
//! The canonical surface: create flow, get flow, advance, spawn and list
//! workers, heartbeat, intent locks and conflicts, session lifecycle,
//! list events since a sequence number, stream events over SSE, list
//! scorecards, and summarize cost. Engine error codes map onto HTTP
//! status classes; everything else is a 500.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::bridge::Bridge;
use crate::domain::{
    CostAction, CostDelta, Intent, Phase, SessionConfig, TransitionTrigger, WorkerSpec,
    WorkflowEvent,
};
use crate::errors::EngineError;
use crate::guard::Guard;
use crate::store::StoreHandle;
use crate::team::{ConflictDetector, DigestBuilder, IntentResolver, Supervisor, WorkerManager};
use crate::workflow::fsm::Engine;

/// Shared dependencies for all handlers.
pub struct AppState {
    pub engine: Engine,
    pub guard: Arc<Guard>,
    pub store: StoreHandle,
    pub manager: WorkerManager,
    pub supervisor: Arc<Supervisor>,
    pub resolver: IntentResolver,
    pub conflicts: ConflictDetector,
    pub digests: DigestBuilder,
    pub bridge: Arc<Bridge>,
    pub workspace: String,
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateFlowRequest {
    pub task_id: String,
    #[serde(default)]
    pub budget_cap_usd: f64,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub action: String,
    #[serde(default)]
    pub actor: String,
}

#[derive(Deserialize)]
pub struct SpawnWorkerRequest {
    pub phase: Phase,
    pub role: String,
    #[serde(default)]
    pub file_ownership: Vec<String>,
    #[serde(default)]
    pub soft_timeout_sec: i64,
    #[serde(default)]
    pub hard_timeout_sec: i64,
}

#[derive(Deserialize)]
pub struct AcquireIntentRequest {
    pub intent_id: String,
    pub worker_id: String,
    pub target_file: String,
    pub operation: String,
    #[serde(default)]
    pub pre_hash: String,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_sec: i64,
}

fn default_lease_duration() -> i64 {
    300
}

#[derive(Deserialize)]
pub struct ExecuteIntentRequest {
    #[serde(default)]
    pub current_hash: String,
    #[serde(default)]
    pub post_hash: String,
}

#[derive(Deserialize)]
struct SinceSeqParams {
    #[serde(default)]
    since_seq: i64,
}

#[derive(serde::Serialize)]
pub struct CostSummary {
    pub budget_used_usd: f64,
    pub budget_cap_usd: f64,
    pub cost_action: CostAction,
    pub deltas: Vec<CostDelta>,
}

// ── Error mapping ─────────────────────────────────────────────────────

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::FlowNotFound(_)
            | EngineError::WorkerNotFound(_)
            | EngineError::IntentNotFound(_)
            | EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateTask(_) | EngineError::IntentConflict(_) => StatusCode::CONFLICT,
            EngineError::BudgetExceeded(_) | EngineError::PermissionDenied(_) => {
                StatusCode::FORBIDDEN
            }
            EngineError::RateLimitExceeded(_) | EngineError::WorkerLimitReached { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::InvalidTransition(_)
            | EngineError::PhaseGateFailed { .. }
            | EngineError::FlowAlreadyDone(_)
            | EngineError::LeaseExpired(_)
            | EngineError::IntentHashMismatch(_)
            | EngineError::FileOwnership(_)
            | EngineError::WorkerAlreadyDone(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/flow", post(create_flow))
        .route("/api/v1/flow/:task_id", get(get_flow))
        .route("/api/v1/flow/:task_id/advance", post(advance_flow))
        .route(
            "/api/v1/flow/:task_id/workers",
            get(list_workers).post(spawn_worker),
        )
        .route("/api/v1/flow/:task_id/intents", post(acquire_intent))
        .route("/api/v1/flow/:task_id/conflicts", get(list_conflicts))
        .route("/api/v1/flow/:task_id/events", get(list_events))
        .route("/api/v1/flow/:task_id/events/stream", get(stream_events))
        .route("/api/v1/flow/:task_id/reviews", get(list_reviews))
        .route("/api/v1/flow/:task_id/cost", get(get_cost))
        .route("/api/v1/workers/:worker_id/heartbeat", post(worker_heartbeat))
        .route("/api/v1/workers/:worker_id/session", post(start_worker_session))
        .route("/api/v1/intents/:intent_id", delete(release_intent))
        .route("/api/v1/intents/:intent_id/execute", post(execute_intent))
        .route("/api/v1/sessions/:session_id", delete(stop_worker_session))
        .route(
            "/api/v1/sessions/:session_id/events",
            get(stream_session_events),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Flow handlers ─────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_flow(
    State(state): State<SharedState>,
    Json(req): Json<CreateFlowRequest>,
) -> Result<Response, ApiError> {
    if req.task_id.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"code": 400, "message": "task_id is required"})),
        )
            .into_response());
    }

    state.engine.start_flow(&req.task_id, req.budget_cap_usd).await?;
    state
        .supervisor
        .start_monitoring(req.task_id.clone(), state.shutdown.clone());

    let flow = state.engine.get_state(&req.task_id).await?;
    Ok((StatusCode::CREATED, Json(flow)).into_response())
}

async fn get_flow(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let flow = state.engine.get_state(&task_id).await?;
    Ok(Json(flow).into_response())
}

async fn advance_flow(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> Result<Response, ApiError> {
    if req.action.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"code": 400, "message": "action is required"})),
        )
            .into_response());
    }

    let trigger = TransitionTrigger {
        action: req.action,
        actor: req.actor,
    };
    state.engine.advance(&task_id, &trigger).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Worker handlers ───────────────────────────────────────────────────

async fn spawn_worker(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Json(req): Json<SpawnWorkerRequest>,
) -> Result<Response, ApiError> {
    // The flow must exist before workers attach to it.
    state.engine.get_state(&task_id).await?;

    let spec = WorkerSpec {
        task_id: task_id.clone(),
        phase: req.phase,
        role: req.role,
        file_ownership: req.file_ownership,
        soft_timeout_sec: req.soft_timeout_sec,
        hard_timeout_sec: req.hard_timeout_sec,
    };

    // The digest carries task state, snapshot, and pending intents across
    // the phase boundary; it is handed to the worker at spawn time.
    let digest = state.digests.build(&task_id, req.phase, &spec).await?;
    let worker = state.manager.spawn(&spec).await?;
    state
        .supervisor
        .start_monitoring(task_id, state.shutdown.clone());

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"worker": worker, "digest": digest})),
    )
        .into_response())
}

async fn list_workers(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let workers = state
        .store
        .call(move |store| store.list_workers(&task_id))
        .await?;
    Ok(Json(workers).into_response())
}

async fn worker_heartbeat(
    State(state): State<SharedState>,
    Path(worker_id): Path<String>,
) -> Result<Response, ApiError> {
    state.supervisor.heartbeat(&worker_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Intent handlers ───────────────────────────────────────────────────

async fn acquire_intent(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Json(req): Json<AcquireIntentRequest>,
) -> Result<Response, ApiError> {
    let intent = Intent {
        intent_id: req.intent_id.clone(),
        task_id,
        worker_id: req.worker_id,
        target_file: req.target_file,
        operation: req.operation,
        pre_hash: req.pre_hash,
        payload_hash: req.payload_hash,
        ..Default::default()
    };
    state.resolver.acquire_lock(&intent, req.lease_duration_sec).await?;

    let stored = state
        .store
        .call(move |store| store.get_intent(&req.intent_id))
        .await?;
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

async fn release_intent(
    State(state): State<SharedState>,
    Path(intent_id): Path<String>,
) -> Result<Response, ApiError> {
    state.resolver.release_lock(&intent_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn execute_intent(
    State(state): State<SharedState>,
    Path(intent_id): Path<String>,
    Json(req): Json<ExecuteIntentRequest>,
) -> Result<Response, ApiError> {
    state
        .resolver
        .execute(&intent_id, &req.current_hash, &req.post_hash)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_conflicts(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let conflicts = state.conflicts.detect(&task_id).await?;
    Ok(Json(conflicts).into_response())
}

// ── Session handlers ──────────────────────────────────────────────────

async fn start_worker_session(
    State(state): State<SharedState>,
    Path(worker_id): Path<String>,
) -> Result<Response, ApiError> {
    let worker = state
        .store
        .call(move |store| store.get_worker(&worker_id))
        .await?;

    let config = SessionConfig {
        task_id: worker.task_id.clone(),
        role: worker.role.clone(),
        workspace: state.workspace.clone(),
        ..Default::default()
    };
    let session_id = state.bridge.start_session(&worker, config).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"session_id": session_id})),
    )
        .into_response())
}

async fn stop_worker_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    state.bridge.stop_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// SSE stream of a session's normalized events, routed through the
/// bridge so cost events are folded into the budget before delivery.
async fn stream_session_events(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state
        .bridge
        .stream_events(&session_id, state.shutdown.clone())
        .await?;

    let stream = futures::stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        let data = serde_json::to_string(&event).ok()?;
        Some((Ok(Event::default().data(data)), events))
    });
    Ok(Sse::new(stream))
}

// ── Event / review / cost handlers ────────────────────────────────────

async fn list_events(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Query(params): Query<SinceSeqParams>,
) -> Result<Response, ApiError> {
    let events = state
        .store
        .call(move |store| store.list_events_since(&task_id, params.since_seq))
        .await?;
    Ok(Json(events).into_response())
}

async fn list_reviews(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let cards = state
        .store
        .call(move |store| store.list_score_cards(&task_id))
        .await?;
    Ok(Json(cards).into_response())
}

async fn get_cost(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let flow = state.engine.get_state(&task_id).await?;
    let id = task_id.clone();
    let deltas = state
        .store
        .call(move |store| store.list_cost_deltas(&id))
        .await?;
    let cost_action = state.guard.check_budget(&task_id).await?;

    Ok(Json(CostSummary {
        budget_used_usd: flow.budget_used_usd,
        budget_cap_usd: flow.budget_cap_usd,
        cost_action,
        deltas,
    })
    .into_response())
}

/// SSE stream of workflow events: the full backlog first, then new events
/// polled every two seconds. Each event is one `data:` line of JSON. The
/// stream ends when the client disconnects or a read fails.
async fn stream_events(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    struct Cursor {
        store: StoreHandle,
        task_id: String,
        last_seq: i64,
        pending: VecDeque<WorkflowEvent>,
    }

    let cursor = Cursor {
        store: state.store.clone(),
        task_id,
        last_seq: 0,
        pending: VecDeque::new(),
    };

    let stream = futures::stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(event) = cursor.pending.pop_front() {
                let data = match serde_json::to_string(&event) {
                    Ok(data) => data,
                    Err(_) => continue,
                };
                return Some((Ok(Event::default().data(data)), cursor));
            }

            let task_id = cursor.task_id.clone();
            let since = cursor.last_seq;
            match cursor
                .store
                .call(move |store| store.list_events_since(&task_id, since))
                .await
            {
                Ok(events) if !events.is_empty() => {
                    for event in events {
                        cursor.last_seq = event.seq_no;
                        cursor.pending.push_back(event);
                    }
                }
                Ok(_) => tokio::time::sleep(Duration::from_secs(2)).await,
                Err(_) => return None,
            }
        }
    });

    Sse::new(stream)
}
