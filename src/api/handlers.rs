//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AppError, DatabaseError, ErrorDetail, ErrorResponse, FeeError, FeeQuote, FeeQuoteRequest,
    FeeTransaction, HealthResponse, HealthStatus, InitiateSettlementRequest, LedgerError,
    PaginatedResponse, PaginationParams, RateLimitResponse, SettlementError,
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fee Settlement API",
        version = "0.1.0",
        description = "Fee quotes and ledger settlement of platform fees",
        license(
            name = "MIT"
        )
    ),
    paths(
        fee_quote_handler,
        initiate_settlement_handler,
        list_fee_transactions_handler,
        get_fee_transaction_handler,
        refund_handler,
        retry_settlement_handler,
        cancel_scheduled_retry_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
        super::admin::get_fee_schedule_handler,
        super::admin::replace_fee_schedule_handler,
    ),
    components(
        schemas(
            FeeQuote,
            FeeQuoteRequest,
            FeeTransaction,
            InitiateSettlementRequest,
            crate::domain::UserContext,
            crate::domain::UserTier,
            crate::domain::FeeTier,
            crate::domain::FeeStatus,
            crate::domain::Asset,
            crate::domain::FeeMetadata,
            crate::domain::FeeSnapshot,
            crate::domain::PromotionSnapshot,
            crate::domain::FeeSchedule,
            crate::domain::TierRates,
            crate::domain::Promotion,
            crate::domain::UnknownPromotionPolicy,
            PaginationParams,
            PaginatedResponse<FeeTransaction>,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "fees", description = "Fee computation"),
        (name = "settlements", description = "Fee transaction lifecycle"),
        (name = "admin", description = "Fee schedule administration"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Compute a fee quote
///
/// Pure computation: nothing is persisted and the ledger is not contacted.
#[utoipa::path(
    post,
    path = "/fee-quotes",
    tag = "fees",
    request_body = FeeQuoteRequest,
    responses(
        (status = 200, description = "Fee computed", body = FeeQuote),
        (status = 400, description = "Invalid amount or user context", body = ErrorResponse),
        (status = 422, description = "Unknown promotion code or amount overflow", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse)
    )
)]
pub async fn fee_quote_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FeeQuoteRequest>,
) -> Result<Json<FeeQuote>, AppError> {
    let quote = state.service.compute_fee_quote(&payload).await?;
    Ok(Json(quote))
}

/// Initiate settlement of a trade fee
///
/// Creates a PENDING fee transaction and queues it for ledger submission.
/// **The response reflects acceptance, not collection.** Poll
/// `GET /fee-transactions/{id}` to follow the status:
/// - `PENDING` → queued or being submitted
/// - `COLLECTED` → accepted by the ledger
/// - `FAILED` → rejected; `next_retry_at` is set while automatic retries remain
///
/// Repeating a request for the same `trade_id` returns the existing transaction.
#[utoipa::path(
    post,
    path = "/fee-transactions",
    tag = "settlements",
    request_body = InitiateSettlementRequest,
    responses(
        (status = 200, description = "Fee transaction accepted", body = FeeTransaction),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 422, description = "Unknown promotion code or amount overflow", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn initiate_settlement_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitiateSettlementRequest>,
) -> Result<Json<FeeTransaction>, AppError> {
    let tx = state.service.initiate_settlement(&payload).await?;
    Ok(Json(tx))
}

/// List fee transactions, newest first
#[utoipa::path(
    get,
    path = "/fee-transactions",
    tag = "settlements",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum number of transactions to return (1-100, default: 20)"),
        ("cursor" = Option<String>, Query, description = "Transaction ID to continue after")
    ),
    responses(
        (status = 200, description = "Page of fee transactions", body = PaginatedResponse<FeeTransaction>),
        (status = 400, description = "Invalid cursor", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse)
    )
)]
pub async fn list_fee_transactions_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<PaginatedResponse<FeeTransaction>>, AppError> {
    let limit = params.limit.clamp(1, 100);
    let page = state
        .service
        .list_transactions(limit, params.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

/// Get a fee transaction by ID
#[utoipa::path(
    get,
    path = "/fee-transactions/{id}",
    tag = "settlements",
    params(
        ("id" = String, Path, description = "Fee transaction ID")
    ),
    responses(
        (status = 200, description = "Fee transaction found", body = FeeTransaction),
        (status = 404, description = "Fee transaction not found", body = ErrorResponse)
    )
)]
pub async fn get_fee_transaction_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeeTransaction>, AppError> {
    let tx = state.service.get_transaction(&id).await?;
    Ok(Json(tx))
}

/// Refund a collected fee
///
/// Bookkeeping only; no ledger payment is issued. Refunding an already
/// refunded transaction returns it unchanged.
#[utoipa::path(
    post,
    path = "/fee-transactions/{id}/refund",
    tag = "settlements",
    params(
        ("id" = String, Path, description = "Fee transaction ID")
    ),
    responses(
        (status = 200, description = "Fee refunded", body = FeeTransaction),
        (status = 404, description = "Fee transaction not found", body = ErrorResponse),
        (status = 409, description = "Not refundable in its current status, or modified concurrently", body = ErrorResponse)
    )
)]
pub async fn refund_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeeTransaction>, AppError> {
    let tx = state.service.request_refund(&id).await?;
    Ok(Json(tx))
}

/// Retry settlement of a failed fee
///
/// Moves a FAILED transaction back to PENDING and queues it for submission,
/// replacing any scheduled automatic retry.
#[utoipa::path(
    post,
    path = "/fee-transactions/{id}/retry",
    tag = "settlements",
    params(
        ("id" = String, Path, description = "Fee transaction ID")
    ),
    responses(
        (status = 200, description = "Retry queued", body = FeeTransaction),
        (status = 404, description = "Fee transaction not found", body = ErrorResponse),
        (status = 409, description = "Not FAILED, retries exhausted, or modified concurrently", body = ErrorResponse)
    )
)]
pub async fn retry_settlement_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeeTransaction>, AppError> {
    let tx = state.service.retry_settlement(&id).await?;
    Ok(Json(tx))
}

/// Cancel the scheduled automatic retry of a failed fee
#[utoipa::path(
    delete,
    path = "/fee-transactions/{id}/scheduled-retry",
    tag = "settlements",
    params(
        ("id" = String, Path, description = "Fee transaction ID")
    ),
    responses(
        (status = 200, description = "No automatic retry remains scheduled", body = FeeTransaction),
        (status = 404, description = "Fee transaction not found", body = ErrorResponse)
    )
)]
pub async fn cancel_scheduled_retry_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeeTransaction>, AppError> {
    let tx = state.service.cancel_scheduled_retry(&id).await?;
    Ok(Json(tx))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.service.health_check().await)
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "database_error")
                }
                DatabaseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                DatabaseError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            },
            AppError::Ledger(ledger_err) => match ledger_err {
                LedgerError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable"),
                LedgerError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                LedgerError::SubmissionFailed { .. } | LedgerError::InvalidResponse(_) => {
                    (StatusCode::BAD_GATEWAY, "ledger_error")
                }
                LedgerError::InvalidSigningKey(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
                }
            },
            AppError::Fee(fee_err) => match fee_err {
                FeeError::InvalidAmount(_) | FeeError::InvalidRate(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_amount")
                }
                FeeError::Overflow => (StatusCode::UNPROCESSABLE_ENTITY, "amount_overflow"),
                FeeError::UnknownPromotionCode(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "unknown_promotion_code")
                }
            },
            AppError::Settlement(settlement_err) => match settlement_err {
                SettlementError::InvalidStateTransition { .. } => {
                    (StatusCode::CONFLICT, "invalid_state_transition")
                }
                SettlementError::ConcurrentModification(_) => {
                    (StatusCode::CONFLICT, "concurrent_modification")
                }
                SettlementError::RetryExhausted { .. } => (StatusCode::CONFLICT, "retry_exhausted"),
            },
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, "authentication_error"),
            AppError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::NotSupported(_) => (StatusCode::NOT_IMPLEMENTED, "not_supported"),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = self.status_and_type();
        let message = match &self {
            AppError::RateLimited => "Rate limit exceeded".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
