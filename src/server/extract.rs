//! Request extractors.

use super::AppState;
use crate::auth::{AuthError, Identity, bearer_token};
use crate::error::ServiceError;
use crate::types::{Principal, TaskId, UserId};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Path, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use tracing::debug;

/// The caller, resolved from an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::unauthenticated("Authorization header required"))?;
        let token = bearer_token(header).ok_or_else(|| {
            ServiceError::unauthenticated("Authorization header must be a bearer token")
        })?;

        state.identity.resolve(token).map(AuthUser).map_err(|e| {
            debug!(error = %e, "bearer token rejected");
            match e {
                AuthError::Expired => ServiceError::unauthenticated("Token expired"),
                _ => ServiceError::unauthenticated("Invalid token"),
            }
        })
    }
}

/// JSON body whose rejection is reported as `{"error": "Invalid JSON"}`.
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => {
                debug!(error = %rejection, "request body rejected");
                Err(ServiceError::bad_request(json_rejection_message(&rejection)))
            }
        }
    }
}

fn json_rejection_message(rejection: &JsonRejection) -> &'static str {
    match rejection {
        JsonRejection::MissingJsonContentType(_) => "Expected a JSON body",
        _ => "Invalid JSON",
    }
}

/// Parse a numeric path id, reporting `Invalid <what> ID` on failure.
pub fn parse_id(raw: &str, what: &str) -> Result<u64, ServiceError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ServiceError::bad_request(format!("Invalid {what} ID")))
}

/// `{id}` path segment naming a task.
pub struct TaskIdParam(pub TaskId);

impl<S: Send + Sync> FromRequestParts<S> for TaskIdParam {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|_| ServiceError::bad_request("Invalid task ID"))?;
        parse_id(&raw, "task").map(TaskIdParam)
    }
}

/// `{id}` path segment naming a user.
pub struct UserIdParam(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for UserIdParam {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|_| ServiceError::bad_request("Invalid user ID"))?;
        parse_id(&raw, "user").map(UserIdParam)
    }
}
