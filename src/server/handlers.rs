//! HTTP handlers for the `/api/v1` surface.

use super::AppState;
use super::extract::{AuthUser, JsonBody, TaskIdParam, UserIdParam};
use crate::error::{ServiceError, ServiceResult};
use crate::realtime::serve_socket;
use crate::service::{AuthResponse, CreateUserRequest, LoginRequest, RegisterRequest, UserPatch};
use crate::types::{
    Page, StatsReport, Task, TaskDraft, TaskDto, TaskListParams, TaskPatch, UserDto,
};
use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        message: "API is running",
    })
}

/// Run account work on the blocking pool.
///
/// Password hashing and verification are CPU bound and must not occupy a
/// runtime worker that is also driving realtime sessions.
async fn off_runtime<T, F>(f: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::internal(format!("spawn_blocking failed: {e}")))?
}

pub(crate) async fn register(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<RegisterRequest>,
) -> ServiceResult<(StatusCode, Json<AuthResponse>)> {
    let accounts = state.accounts.clone();
    let response = off_runtime(move || accounts.register(request)).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<LoginRequest>,
) -> ServiceResult<Json<AuthResponse>> {
    let accounts = state.accounts.clone();
    Ok(Json(off_runtime(move || accounts.login(request)).await?))
}

pub(crate) async fn profile(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> ServiceResult<Json<UserDto>> {
    Ok(Json(state.accounts.profile(&principal)?))
}

pub(crate) async fn list_users(
    State(state): State<AppState>,
    _caller: AuthUser,
) -> ServiceResult<Json<Vec<UserDto>>> {
    Ok(Json(state.accounts.users()?))
}

pub(crate) async fn get_user(
    State(state): State<AppState>,
    _caller: AuthUser,
    UserIdParam(user_id): UserIdParam,
) -> ServiceResult<Json<UserDto>> {
    Ok(Json(state.accounts.user(user_id)?))
}

pub(crate) async fn create_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    JsonBody(request): JsonBody<CreateUserRequest>,
) -> ServiceResult<(StatusCode, Json<UserDto>)> {
    let accounts = state.accounts.clone();
    let user = off_runtime(move || accounts.create_user(&principal, request)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub(crate) async fn update_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    UserIdParam(user_id): UserIdParam,
    JsonBody(patch): JsonBody<UserPatch>,
) -> ServiceResult<Json<UserDto>> {
    let accounts = state.accounts.clone();
    let user = off_runtime(move || accounts.update_user(&principal, user_id, patch)).await?;
    Ok(Json(user))
}

pub(crate) async fn delete_user(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    UserIdParam(user_id): UserIdParam,
) -> ServiceResult<StatusCode> {
    state.accounts.delete_user(&principal, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_tasks(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Query(params): Query<TaskListParams>,
) -> ServiceResult<Json<Page<TaskDto>>> {
    let query = params.normalize();
    let page = state.tasks.list(&principal, &query)?;
    let Page {
        items,
        total,
        page,
        page_size,
        total_pages,
    } = page;
    Ok(Json(Page {
        items: state.tasks.hydrate_with_subtasks(items)?,
        total,
        page,
        page_size,
        total_pages,
    }))
}

pub(crate) async fn create_task(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    JsonBody(draft): JsonBody<TaskDraft>,
) -> ServiceResult<(StatusCode, Json<TaskDto>)> {
    let task = state.tasks.create(&principal, draft)?;
    Ok((StatusCode::CREATED, Json(hydrate_one(&state, task)?)))
}

pub(crate) async fn get_task(
    State(state): State<AppState>,
    _caller: AuthUser,
    TaskIdParam(task_id): TaskIdParam,
) -> ServiceResult<Json<TaskDto>> {
    Ok(Json(state.tasks.get_detailed(task_id)?))
}

pub(crate) async fn update_task(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    TaskIdParam(task_id): TaskIdParam,
    JsonBody(patch): JsonBody<TaskPatch>,
) -> ServiceResult<Json<TaskDto>> {
    let task = state.tasks.update(&principal, task_id, patch)?;
    Ok(Json(hydrate_one(&state, task)?))
}

pub(crate) async fn delete_task(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    TaskIdParam(task_id): TaskIdParam,
) -> ServiceResult<StatusCode> {
    state.tasks.delete(&principal, task_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_subtasks(
    State(state): State<AppState>,
    _caller: AuthUser,
    TaskIdParam(task_id): TaskIdParam,
) -> ServiceResult<Json<Vec<Task>>> {
    Ok(Json(state.tasks.subtasks(task_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StatsParams {
    user_id: Option<String>,
}

pub(crate) async fn stats(
    State(state): State<AppState>,
    _caller: AuthUser,
    Query(params): Query<StatsParams>,
) -> ServiceResult<Json<StatsReport>> {
    let user_id = match params.user_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let id = raw
                .parse::<u64>()
                .map_err(|_| ServiceError::invalid_value("user_id", "Invalid user ID"))?;
            if state.db.get_user(id)?.is_none() {
                return Err(ServiceError::user_not_found());
            }
            Some(id)
        }
    };
    Ok(Json(state.db.stats_report(user_id)?))
}

pub(crate) async fn websocket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let bus = state.bus.clone();
    let identity: Arc<dyn crate::auth::Identity> = state.identity.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, bus, identity))
}

pub(crate) async fn not_found() -> Response {
    ServiceError::not_found("Not found").into_response()
}

fn hydrate_one(state: &AppState, task: Task) -> ServiceResult<TaskDto> {
    state
        .tasks
        .hydrate(vec![task])?
        .pop()
        .ok_or_else(|| ServiceError::internal("hydrate returned no task"))
}
