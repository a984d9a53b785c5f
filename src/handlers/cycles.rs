//! Handlers for triggering scheduler cycles on demand.
//!
//! Manual cycles run through the same gates as the background timers, so a
//! request made while the timer is mid-cycle gets a 409 instead of a second
//! concurrent run.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::json;
use utoipa::IntoParams;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, cycle_in_progress, validation_error};
use crate::poller::PollCycleSummary;
use crate::providers::Provider;
use crate::server::AppState;
use crate::token_refresh::RefreshCycleSummary;

/// Run a token refresh cycle immediately
#[utoipa::path(
    post,
    path = "/cycles/token-refresh",
    responses(
        (status = 200, description = "Cycle completed", body = RefreshCycleSummary),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 409, description = "A refresh cycle is already running", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "cycles"
)]
pub async fn run_token_refresh_cycle(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<RefreshCycleSummary>, ApiError> {
    match state.token_refresh.try_run_cycle().await {
        Some(summary) => Ok(Json(summary)),
        None => Err(cycle_in_progress("token refresh")),
    }
}

/// Query parameters for a manual poll cycle
#[derive(Debug, Deserialize, IntoParams)]
pub struct PollCycleQuery {
    /// Restrict the cycle to one provider and poll it regardless of cadence
    pub provider: Option<String>,
}

/// Run a poll cycle immediately
#[utoipa::path(
    post,
    path = "/cycles/poll",
    params(PollCycleQuery),
    responses(
        (status = 200, description = "Cycle completed", body = PollCycleSummary),
        (status = 400, description = "Unknown provider", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 409, description = "A poll cycle is already running", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "cycles"
)]
pub async fn run_poll_cycle(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<PollCycleQuery>,
) -> Result<Json<PollCycleSummary>, ApiError> {
    let force = match query.provider.as_deref() {
        Some(name) => {
            let provider = Provider::parse(name).ok_or_else(|| {
                validation_error(
                    "Unknown provider",
                    json!({ "provider": format!("'{name}' is not a supported provider") }),
                )
            })?;
            Some(provider)
        }
        None => None,
    };

    match state.poller.try_run_cycle(force).await {
        Some(summary) => Ok(Json(summary)),
        None => Err(cycle_in_progress("poll")),
    }
}
