//! Admin API handlers for fee schedule management.
//!
//! When an admin token is configured every request must carry it in the
//! `x-admin-token` header.

use std::sync::Arc;

use axum::{Json, extract::State, http::HeaderMap};
use secrecy::ExposeSecret;
use tracing::warn;

use crate::app::AppState;
use crate::domain::{AppError, FeeSchedule};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &state.admin_token else {
        return Ok(());
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Authentication(format!("Missing {ADMIN_TOKEN_HEADER} header")))?;
    if provided != expected.expose_secret() {
        return Err(AppError::Authentication("Invalid admin token".to_string()));
    }
    Ok(())
}

/// Current fee schedule
///
/// GET /admin/fee-schedule
#[utoipa::path(
    get,
    path = "/admin/fee-schedule",
    tag = "admin",
    responses(
        (status = 200, description = "Fee schedule in effect", body = FeeSchedule),
        (status = 401, description = "Missing or invalid admin token", body = crate::domain::ErrorResponse),
    )
)]
pub async fn get_fee_schedule_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<FeeSchedule>, AppError> {
    authorize(&state, &headers)?;
    Ok(Json(state.service.fee_schedule()))
}

/// Replace the fee schedule
///
/// PUT /admin/fee-schedule
///
/// Applies to fees computed after the call. Existing transactions keep the
/// rate they were created with.
#[utoipa::path(
    put,
    path = "/admin/fee-schedule",
    tag = "admin",
    request_body = FeeSchedule,
    responses(
        (status = 200, description = "Fee schedule replaced", body = FeeSchedule),
        (status = 400, description = "Invalid schedule", body = crate::domain::ErrorResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::domain::ErrorResponse),
        (status = 501, description = "Configuration is read-only", body = crate::domain::ErrorResponse),
    )
)]
pub async fn replace_fee_schedule_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<FeeSchedule>,
) -> Result<Json<FeeSchedule>, AppError> {
    authorize(&state, &headers)?;
    state.service.replace_fee_schedule(payload)?;

    let schedule = state.service.fee_schedule();
    warn!(
        standard = %schedule.rates.standard,
        high_volume = %schedule.rates.high_volume,
        vip = %schedule.rates.vip,
        promotions = schedule.promotions.len(),
        "Admin replaced fee schedule"
    );
    Ok(Json(schedule))
}
