//! Router construction, middleware stack and rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use governor::{
    DefaultDirectRateLimiter, Quota, RateLimiter, clock::Clock, clock::DefaultClock,
};
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::domain::{ErrorDetail, RateLimitResponse};

use super::admin::{get_fee_schedule_handler, replace_fee_schedule_handler};
use super::handlers::{
    ApiDoc, cancel_scheduled_retry_handler, fee_quote_handler, get_fee_transaction_handler,
    health_check_handler, initiate_settlement_handler, list_fee_transactions_handler,
    liveness_handler, readiness_handler, refund_handler, retry_settlement_handler,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Global request rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

impl RateLimitConfig {
    /// Read `RATE_LIMIT_RPS` and `RATE_LIMIT_BURST`, falling back to defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests_per_second: std::env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.requests_per_second),
            burst_size: std::env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.burst_size),
        }
    }

    fn quota(&self) -> Quota {
        let rps = NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst_size).unwrap_or(rps);
        Quota::per_second(rps).allow_burst(burst)
    }
}

async fn rate_limit_middleware(
    State(limiter): State<Arc<DefaultDirectRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(request).await,
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after = wait.as_secs().max(1);
            warn!(retry_after, "Rate limit exceeded");

            let body = Json(RateLimitResponse {
                error: ErrorDetail {
                    r#type: "rate_limited".to_string(),
                    message: "Rate limit exceeded".to_string(),
                },
                retry_after,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

fn api_routes(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/fee-quotes", post(fee_quote_handler))
        .route(
            "/fee-transactions",
            post(initiate_settlement_handler).get(list_fee_transactions_handler),
        )
        .route("/fee-transactions/{id}", get(get_fee_transaction_handler))
        .route("/fee-transactions/{id}/refund", post(refund_handler))
        .route("/fee-transactions/{id}/retry", post(retry_settlement_handler))
        .route(
            "/fee-transactions/{id}/scheduled-retry",
            delete(cancel_scheduled_retry_handler),
        )
        .route(
            "/admin/fee-schedule",
            get(get_fee_schedule_handler).put(replace_fee_schedule_handler),
        )
        .with_state(app_state)
}

fn health_routes(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(app_state)
}

fn finish(router: Router) -> Router {
    router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Build the application router without rate limiting
pub fn create_router(app_state: Arc<AppState>) -> Router {
    finish(api_routes(Arc::clone(&app_state)).merge(health_routes(app_state)))
}

/// Build the application router with a global rate limit on the API routes.
///
/// Health probes are never limited.
pub fn create_router_with_rate_limit(app_state: Arc<AppState>, config: RateLimitConfig) -> Router {
    info!(
        rps = config.requests_per_second,
        burst = config.burst_size,
        "Rate limiting enabled"
    );
    let limiter = Arc::new(RateLimiter::direct(config.quota()));
    let limited = api_routes(Arc::clone(&app_state))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
    finish(limited.merge(health_routes(app_state)))
}
