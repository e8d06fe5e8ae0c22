use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use hydra_core::event::{EventKind, OrchestratorStatus};
use hydra_core::hitl::HitlError;
use hydra_core::host::{with_retry, HostError};
use hydra_core::ingest::IngestError;
use hydra_core::types::Stage;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, kind: &str, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "kind": kind, "message": message.to_string() })))
}

fn host_error(e: &HostError) -> ApiError {
    api_error(StatusCode::BAD_GATEWAY, e.kind(), e)
}

fn hitl_error(e: HitlError) -> ApiError {
    match e {
        HitlError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "not_found", e),
        HitlError::NotMemorySuggestion(_) | HitlError::NoWorker(_) => {
            api_error(StatusCode::CONFLICT, "conflict", e)
        }
        HitlError::Host(ref err) => host_error(err),
    }
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct IntentBody {
    pub text: String,
}

#[derive(Deserialize)]
pub(crate) struct RetryBody {
    #[serde(default)]
    pub feedback: String,
}

#[derive(Deserialize)]
pub(crate) struct AnswerBody {
    pub answer: String,
}

#[derive(Deserialize)]
pub(crate) struct RequestChangesBody {
    pub issue_number: u64,
    #[serde(default)]
    pub feedback: String,
    pub stage: String,
}

#[derive(Deserialize)]
pub(crate) struct BgWorkerBody {
    pub name: String,
    pub enabled: bool,
}

#[derive(Deserialize)]
pub(crate) struct BgWorkerIntervalBody {
    pub name: String,
    pub interval_seconds: u64,
}

#[derive(Deserialize)]
pub(crate) struct StageToggleBody {
    pub stage: String,
    pub enabled: bool,
}

#[derive(Deserialize)]
pub(crate) struct EventsQuery {
    pub since: Option<DateTime<Utc>>,
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

// ── Intents ───────────────────────────────────────────────────────────────

pub(crate) async fn post_intent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IntentBody>,
) -> Result<Json<Value>, ApiError> {
    match state.hydra.ingest.submit_intent(&body.text).await {
        Ok(issue_number) => Ok(Json(json!({ "issue_number": issue_number }))),
        Err(IngestError::Invalid(msg)) => {
            Err(api_error(StatusCode::BAD_REQUEST, "invalid_intent", msg))
        }
        Err(IngestError::Host(e)) => {
            if matches!(e, HostError::Auth(_)) {
                state
                    .hydra
                    .bus
                    .publish(EventKind::OrchestratorStatus {
                        status: OrchestratorStatus::AuthFailed,
                        reset: false,
                    })
                    .await;
                state.hydra.shutdown.request(3);
            }
            Err(host_error(&e))
        }
    }
}

// ── Pipeline views ────────────────────────────────────────────────────────

pub(crate) async fn get_pipeline(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.hydra.store.snapshot().await;
    let mut stages = serde_json::Map::new();
    for stage in Stage::ALL {
        let issues = snapshot.get(&stage).cloned().unwrap_or_default();
        stages.insert(stage.as_str().to_string(), json!(issues));
    }
    Json(json!({ "stages": stages }))
}

pub(crate) async fn get_prs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut prs = state.hydra.store.open_prs().await;
    prs.sort_by_key(|p| p.pr);
    Json(json!(prs))
}

pub(crate) async fn get_queue(State(state): State<Arc<AppState>>) -> Json<Value> {
    let depths = state.hydra.store.queue_depths().await;
    let mut out = serde_json::Map::new();
    for stage in Stage::ALL {
        if let Some(depth) = depths.get(&stage) {
            out.insert(stage.as_str().to_string(), json!(depth));
        }
    }
    Json(Value::Object(out))
}

// ── HITL ──────────────────────────────────────────────────────────────────

pub(crate) async fn get_hitl(State(state): State<Arc<AppState>>) -> Json<Value> {
    let items: Vec<Value> = state
        .hydra
        .hitl
        .list()
        .await
        .into_iter()
        .map(|item| {
            json!({
                "issue": item.issue,
                "title": item.title,
                "branch": item.branch,
                // 0 means "no PR" in the HITL view.
                "pr": item.pr.unwrap_or(0),
                "prUrl": item.pr_url,
                "status": item.status,
                "cause": item.cause,
                "isMemorySuggestion": item.is_memory_suggestion,
            })
        })
        .collect();
    Json(json!(items))
}

pub(crate) async fn hitl_retry(
    State(state): State<Arc<AppState>>,
    Path(issue): Path<u64>,
    Json(body): Json<RetryBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .hydra
        .hitl
        .retry(issue, &body.feedback)
        .await
        .map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn hitl_skip(
    State(state): State<Arc<AppState>>,
    Path(issue): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.hydra.hitl.skip(issue).await.map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn hitl_close(
    State(state): State<Arc<AppState>>,
    Path(issue): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.hydra.hitl.close(issue).await.map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn hitl_approve(
    State(state): State<Arc<AppState>>,
    Path(issue): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state
        .hydra
        .hitl
        .approve_as_memory(issue)
        .await
        .map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn post_human_input(
    State(state): State<Arc<AppState>>,
    Path(issue): Path<u64>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .hydra
        .hitl
        .answer(issue, &body.answer)
        .await
        .map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn get_human_input(State(state): State<Arc<AppState>>) -> Json<Value> {
    let questions: HashMap<String, String> = state
        .hydra
        .hitl
        .pending_questions()
        .await
        .into_iter()
        .map(|(issue, text)| (issue.to_string(), text))
        .collect();
    Json(json!(questions))
}

pub(crate) async fn post_request_changes(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequestChangesBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(stage) = Stage::parse(&body.stage).filter(|s| Stage::PIPELINE.contains(s)) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_stage",
            format!("{:?} is not a working stage", body.stage),
        ));
    };
    state
        .hydra
        .hitl
        .request_changes(body.issue_number, &body.feedback, stage)
        .await
        .map_err(hitl_error)?;
    Ok(Json(json!({ "status": "accepted" })))
}

// ── Control ───────────────────────────────────────────────────────────────

pub(crate) async fn control_start(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.hydra.scheduler.start();
    Json(json!({ "status": "accepted" }))
}

pub(crate) async fn control_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.hydra.scheduler.stop();
    Json(json!({ "status": "accepted" }))
}

pub(crate) async fn control_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let view = state.hydra.scheduler.view().await.ok_or_else(|| {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "scheduler_down", "scheduler not running")
    })?;
    let config = &state.hydra.config;
    Ok(Json(json!({
        "status": view.status,
        "stages": view.enabled,
        "active": view.active,
        "batch": view.batch,
        "config": {
            "max_triagers": config.max_triagers,
            "max_planners": config.max_planners,
            "max_workers": config.max_workers,
            "max_reviewers": config.max_reviewers,
            "listen_addr": config.listen_addr,
            "pipeline_label": config.pipeline_label,
            "snapshot_interval_sec": config.snapshot_interval_sec,
        },
    })))
}

pub(crate) async fn control_stage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StageToggleBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(stage) = Stage::parse(&body.stage).filter(|s| Stage::PIPELINE.contains(s)) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_stage",
            format!("{:?} is not a working stage", body.stage),
        ));
    };
    state.hydra.scheduler.set_stage_enabled(stage, body.enabled);
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn control_bg_worker(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BgWorkerBody>,
) -> Result<Json<Value>, ApiError> {
    if !state.hydra.loops.set_enabled(&body.name, body.enabled).await {
        return Err(api_error(StatusCode::NOT_FOUND, "not_found", format!("no loop named {:?}", body.name)));
    }
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn control_bg_worker_interval(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BgWorkerIntervalBody>,
) -> Result<Json<Value>, ApiError> {
    if body.interval_seconds == 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid_interval", "interval must be at least 1 second"));
    }
    if !state
        .hydra
        .loops
        .set_interval(&body.name, body.interval_seconds)
        .await
    {
        return Err(api_error(StatusCode::NOT_FOUND, "not_found", format!("no loop named {:?}", body.name)));
    }
    Ok(Json(json!({ "status": "accepted" })))
}

pub(crate) async fn get_system_workers(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.hydra.loops.snapshot().await))
}

// ── Metrics & stats ───────────────────────────────────────────────────────

pub(crate) async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.hydra.metrics.current().await))
}

pub(crate) async fn get_metrics_history(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.hydra.metrics.history().await))
}

pub(crate) async fn get_metrics_github(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let host = Arc::clone(&state.hydra.host);
    let label = state.hydra.config.pipeline_label.clone();
    let issues = with_retry("list_open_issues", || {
        let host = Arc::clone(&host);
        let label = label.clone();
        async move { host.list_open_issues(&label).await }
    })
    .await
    .map_err(|e| host_error(&e))?;
    let prs = with_retry("list_open_prs", || {
        let host = Arc::clone(&host);
        async move { host.list_open_prs().await }
    })
    .await
    .map_err(|e| host_error(&e))?;
    Ok(Json(json!({
        "open_issues": issues.len(),
        "open_prs": prs.len(),
    })))
}

pub(crate) async fn get_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.hydra.metrics.lifetime().await))
}

// ── Event backfill ────────────────────────────────────────────────────────

pub(crate) async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Json<Value> {
    let events = match q.since {
        Some(since) => state.hydra.bus.snapshot_after(since).await,
        None => state.hydra.bus.snapshot_since(0).await,
    };
    let events: Vec<Value> = events
        .iter()
        .map(|e| serde_json::to_value(&**e).unwrap_or(Value::Null))
        .collect();
    Json(json!(events))
}
