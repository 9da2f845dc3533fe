//! Management API under `/api`. Every request carries the shared bearer token and
//! the id of the user it acts for; access control is left to the controller.

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use pyhost_process::{TargetId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    error_payload::ApiError,
    http::AppState,
    lifecycle::{
        DeleteOutcome, LifecycleError, StartOutcome, StopOutcome, TargetInfo, TargetSummary,
    },
    repo::repo_name_from_url,
    stats::ServerStats,
};

pub const CALLER_HEADER: &str = "x-pyhost-caller";

const DEFAULT_LOG_BYTES: u64 = 2000;

#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/targets", get(list_targets))
        .route("/targets/inspect", get(inspect_target))
        .route("/targets/logs", get(target_logs))
        .route("/targets/start", post(start_target))
        .route("/targets/stop", post(stop_target))
        .route("/targets/restart", post(restart_target))
        .route("/targets/delete", post(delete_target))
        .route("/targets/env", post(append_env))
        .route("/uploads", post(upload))
        .route("/repos", post(register_repo))
        .route("/repos/candidates", get(repo_candidates))
        .route("/stats", get(stats))
        .route("/users", get(list_users))
        .route("/users/add", post(add_user))
        .route("/users/remove", post(remove_user))
        .layer(middleware::from_fn_with_state(state, api_auth))
}

fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

// Middleware: shared bearer token, then the caller id header.
async fn api_auth(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return ApiError::unauthorized("api disabled").into_response();
    };
    let ok = bearer_token(req.headers())
        .is_some_and(|t| tokens_match(t.as_bytes(), expected.as_bytes()));
    if !ok {
        tracing::warn!("api request with missing or invalid token");
        return ApiError::unauthorized("invalid token").into_response();
    }

    let caller = req
        .headers()
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<UserId>().ok());
    let Some(caller) = caller else {
        return ApiError::bad_request(format!("missing or invalid {CALLER_HEADER} header"))
            .into_response();
    };

    req.extensions_mut().insert(Caller(caller));
    next.run(req).await
}

#[derive(Debug, Deserialize)]
struct TargetQuery {
    target: String,
    max_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TargetBody {
    target: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    #[serde(flatten)]
    outcome: StartOutcome,
    message: String,
}

impl From<StartOutcome> for StartResponse {
    fn from(outcome: StartOutcome) -> Self {
        Self {
            message: outcome.user_message(),
            outcome,
        }
    }
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    target_id: TargetId,
    log: Option<String>,
}

#[derive(Debug, Serialize)]
struct TargetIdResponse {
    target_id: TargetId,
}

#[derive(Debug, Serialize)]
struct ChangedResponse {
    changed: bool,
}

async fn list_targets(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> ApiResult<Vec<TargetSummary>> {
    Ok(Json(state.controller.list(caller).await))
}

async fn inspect_target(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Query(q): Query<TargetQuery>,
) -> ApiResult<TargetInfo> {
    let id = TargetId::from(q.target);
    Ok(Json(state.controller.inspect(caller, &id).await?))
}

async fn target_logs(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Query(q): Query<TargetQuery>,
) -> ApiResult<LogsResponse> {
    let id = TargetId::from(q.target);
    let log = state
        .controller
        .logs(caller, &id, q.max_bytes.unwrap_or(DEFAULT_LOG_BYTES))
        .await?;
    Ok(Json(LogsResponse { target_id: id, log }))
}

async fn start_target(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<TargetBody>,
) -> ApiResult<StartResponse> {
    let id = TargetId::from(body.target);
    Ok(Json(state.controller.start(caller, &id).await?.into()))
}

async fn restart_target(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<TargetBody>,
) -> ApiResult<StartResponse> {
    let id = TargetId::from(body.target);
    Ok(Json(state.controller.restart(caller, &id).await?.into()))
}

async fn stop_target(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<TargetBody>,
) -> ApiResult<StopOutcome> {
    let id = TargetId::from(body.target);
    Ok(Json(state.controller.stop(caller, &id).await?))
}

async fn delete_target(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<TargetBody>,
) -> ApiResult<DeleteOutcome> {
    let id = TargetId::from(body.target);
    Ok(Json(state.controller.delete(caller, &id).await?))
}

#[derive(Debug, Deserialize)]
struct EnvBody {
    target: String,
    text: String,
}

async fn append_env(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<EnvBody>,
) -> ApiResult<TargetIdResponse> {
    let id = TargetId::from(body.target);
    state.controller.append_env(caller, &id, &body.text).await?;
    Ok(Json(TargetIdResponse { target_id: id }))
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    file_name: String,
    /// When absent the file is expected to be on disk already.
    content: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<UploadBody>,
) -> ApiResult<TargetIdResponse> {
    let target_id = match body.content {
        Some(content) => {
            state
                .controller
                .upload_script(caller, &body.file_name, content.as_bytes())
                .await?
        }
        None => {
            state
                .controller
                .register_upload(caller, &body.file_name)
                .await?
        }
    };
    Ok(Json(TargetIdResponse { target_id }))
}

#[derive(Debug, Deserialize)]
struct RepoBody {
    repo: Option<String>,
    url: Option<String>,
    entry: String,
}

fn repo_name(repo: Option<String>, url: Option<String>) -> Result<String, ApiError> {
    match (repo, url) {
        (Some(repo), _) => Ok(repo),
        (None, Some(url)) => {
            repo_name_from_url(&url).map_err(|e| ApiError::from(LifecycleError::from(e)))
        }
        (None, None) => Err(ApiError::bad_request("either repo or url is required")),
    }
}

async fn register_repo(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<RepoBody>,
) -> ApiResult<TargetIdResponse> {
    let name = repo_name(body.repo, body.url)?;
    let target_id = state
        .controller
        .register_repo_entry(caller, &name, &body.entry)
        .await?;
    Ok(Json(TargetIdResponse { target_id }))
}

#[derive(Debug, Deserialize)]
struct CandidatesQuery {
    repo: Option<String>,
    url: Option<String>,
}

async fn repo_candidates(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Query(q): Query<CandidatesQuery>,
) -> ApiResult<Vec<String>> {
    let name = repo_name(q.repo, q.url)?;
    Ok(Json(state.controller.entry_candidates(caller, &name).await?))
}

async fn stats(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> ApiResult<ServerStats> {
    Ok(Json(state.controller.stats(caller).await?))
}

#[derive(Debug, Deserialize)]
struct UserBody {
    user_id: UserId,
}

async fn list_users(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> ApiResult<Vec<UserId>> {
    Ok(Json(state.controller.list_users(caller).await?))
}

async fn add_user(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<UserBody>,
) -> ApiResult<ChangedResponse> {
    let changed = state.controller.add_user(caller, body.user_id).await?;
    Ok(Json(ChangedResponse { changed }))
}

async fn remove_user(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(body): Json<UserBody>,
) -> ApiResult<ChangedResponse> {
    let changed = state.controller.remove_user(caller, body.user_id).await?;
    Ok(Json(ChangedResponse { changed }))
}
