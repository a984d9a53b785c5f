//! Handlers for per-connection operations.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, not_found, rate_limited};
use crate::rate_limit::{Decision, RateLimitClass, rate_limit_key};
use crate::server::AppState;

/// Response for an on-demand token refresh
#[derive(Debug, Serialize, ToSchema)]
pub struct RefreshConnectionResponse {
    /// The connection the refresh ran against
    #[schema(value_type = String)]
    pub connection_id: Uuid,
    /// What the refresh attempt did
    pub outcome: String,
    /// Connection status after the attempt
    pub status: String,
}

/// Refresh one connection's access token immediately
///
/// Skips and failures still return 200; the `outcome` field says what
/// happened. Only a missing connection or an exhausted rate limit is an
/// error.
#[utoipa::path(
    post,
    path = "/connections/{id}/refresh",
    params(
        ("id" = String, Path, description = "Connection ID")
    ),
    responses(
        (status = 200, description = "Refresh attempted", body = RefreshConnectionResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 429, description = "Too many refresh requests", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "connections"
)]
pub async fn refresh_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<RefreshConnectionResponse>, ApiError> {
    let connection = state
        .repo
        .find_by_id(&id)
        .await?
        .ok_or_else(|| not_found("connection"))?;

    let key = rate_limit_key(Some(connection.user_id), &headers);
    if let Decision::Limited {
        retry_after_seconds,
    } = state
        .rate_limiter
        .check(RateLimitClass::Refresh, &key, Utc::now())
        .await
    {
        return Err(rate_limited(retry_after_seconds));
    }

    let outcome = state
        .token_refresh
        .refresh_connection_by_id(&id)
        .await?
        .ok_or_else(|| not_found("connection"))?;

    // The attempt may have rotated the tokens or parked the connection;
    // report the status it ended up with.
    let status = state
        .repo
        .find_by_id(&id)
        .await?
        .map(|refreshed| refreshed.status)
        .unwrap_or(connection.status);

    Ok(Json(RefreshConnectionResponse {
        connection_id: id,
        outcome: outcome.as_str().to_string(),
        status,
    }))
}
