//! Integration tests for the HTTP API.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

use fee_settlement::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use fee_settlement::app::{AppState, SettlementJob};
use fee_settlement::domain::{
    FeeQuote, FeeSchedule, FeeStatus, FeeTier, FeeTransaction, HealthResponse, HealthStatus,
    PaginatedResponse, SettlementSettings,
};
use fee_settlement::test_utils::{
    MockConfigProvider, MockDatabaseClient, MockLedgerClient, test_settings,
};

struct TestApp {
    state: Arc<AppState>,
    db: Arc<MockDatabaseClient>,
    ledger: Arc<MockLedgerClient>,
    _jobs: mpsc::UnboundedReceiver<SettlementJob>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_settings(test_settings())
    }

    fn with_settings(settings: SettlementSettings) -> Self {
        let db = Arc::new(MockDatabaseClient::new());
        let ledger = Arc::new(MockLedgerClient::new());
        let config = Arc::new(MockConfigProvider::with_settings(settings));
        let (state, jobs) = AppState::new(Arc::clone(&db) as _, Arc::clone(&ledger) as _, config);
        Self {
            state: Arc::new(state),
            db,
            ledger,
            _jobs: jobs,
        }
    }

    fn with_admin_token(mut self, token: &str) -> Self {
        let state = (*self.state).clone().with_admin_token(SecretString::from(token));
        self.state = Arc::new(state);
        self
    }

    fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn settlement_body(trade_id: &str, amount: &str) -> Value {
    json!({
        "trade_id": trade_id,
        "trade_amount": amount,
        "user": { "user_id": "user_1", "user_tier": "STANDARD", "monthly_volume": "0" },
        "asset_code": "XLM",
        "asset_issuer": null,
        "destination_address": null
    })
}

async fn create_transaction(app: &TestApp, trade_id: &str) -> FeeTransaction {
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/fee-transactions",
            &settlement_body(trade_id, "1000"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

mod fee_quote_tests {
    use super::*;

    #[tokio::test]
    async fn test_quote_standard_user() {
        let app = TestApp::new();
        let body = json!({
            "trade_amount": "1000",
            "user": { "user_id": "user_1", "user_tier": "STANDARD", "monthly_volume": "0" }
        });

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-quotes", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let quote: FeeQuote = body_json(response).await;
        assert_eq!(quote.fee_tier, FeeTier::Standard);
        assert_eq!(quote.fee_rate.to_string(), "0.0010");
        assert_eq!(quote.fee_amount.to_string(), "1.0000000");
        assert!(app.db.get_all_items().is_empty());
        assert!(app.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_quote_promotion_overrides_tier() {
        let app = TestApp::new();
        let body = json!({
            "trade_amount": "1000",
            "user": {
                "user_id": "user_1",
                "user_tier": "VIP",
                "monthly_volume": "500000",
                "promotion_code": "launch"
            }
        });

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-quotes", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let quote: FeeQuote = body_json(response).await;
        assert_eq!(quote.fee_tier, FeeTier::Promotional);
        assert_eq!(quote.fee_amount.to_string(), "0.1000000");
        let promotion = quote.promotion.unwrap();
        assert_eq!(promotion.code, "LAUNCH");
        assert_eq!(promotion.original_tier, FeeTier::HighVolume);
    }

    #[tokio::test]
    async fn test_quote_zero_amount_is_bad_request() {
        let app = TestApp::new();
        let body = json!({
            "trade_amount": "0",
            "user": { "user_id": "user_1" }
        });

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-quotes", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let error: Value = body_json(response).await;
        assert_eq!(error["error"]["type"], "invalid_amount");
    }

    #[tokio::test]
    async fn test_quote_unknown_promotion_is_unprocessable() {
        let app = TestApp::new();
        let body = json!({
            "trade_amount": "1000",
            "user": { "user_id": "user_1", "promotion_code": "NOPE" }
        });

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-quotes", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let error: Value = body_json(response).await;
        assert_eq!(error["error"]["type"], "unknown_promotion_code");
    }

    #[tokio::test]
    async fn test_quote_missing_user_id_is_validation_error() {
        let app = TestApp::new();
        let body = json!({
            "trade_amount": "1000",
            "user": { "user_id": "" }
        });

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-quotes", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

mod settlement_tests {
    use super::*;

    #[tokio::test]
    async fn test_initiate_settlement_creates_pending_transaction() {
        let app = TestApp::new();
        let tx = create_transaction(&app, "trade_1").await;

        assert_eq!(tx.status, FeeStatus::Pending);
        assert_eq!(tx.fee_amount.to_string(), "1.0000000");
        assert_eq!(tx.retry_count, 0);
        assert_eq!(tx.destination_address.as_deref(), Some("GPLATFORMWALLET"));
        assert_eq!(tx.trade_id.as_deref(), Some("trade_1"));
        assert_eq!(app.db.get_all_items().len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_settlement_is_idempotent_per_trade() {
        let app = TestApp::new();
        let first = create_transaction(&app, "trade_1").await;
        let second = create_transaction(&app, "trade_1").await;

        assert_eq!(first.id, second.id);
        assert_eq!(app.db.get_all_items().len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_settlement_rejects_issued_asset_without_issuer() {
        let app = TestApp::new();
        let mut body = settlement_body("trade_1", "1000");
        body["asset_code"] = json!("USDC");

        let response = app
            .router()
            .oneshot(json_request("POST", "/fee-transactions", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.db.get_all_items().is_empty());
    }

    #[tokio::test]
    async fn test_get_transaction() {
        let app = TestApp::new();
        let created = create_transaction(&app, "trade_1").await;

        let response = app
            .router()
            .oneshot(empty_request(
                "GET",
                &format!("/fee-transactions/{}", created.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let tx: FeeTransaction = body_json(response).await;
        assert_eq!(tx.id, created.id);
        assert_eq!(tx.metadata.snapshot().promotion, None);
    }

    #[tokio::test]
    async fn test_get_transaction_not_found() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(empty_request("GET", "/fee-transactions/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let error: Value = body_json(response).await;
        assert_eq!(error["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn test_list_transactions_with_pagination() {
        let app = TestApp::new();
        for i in 0..4 {
            create_transaction(&app, &format!("trade_{i}")).await;
        }

        let response = app
            .router()
            .oneshot(empty_request("GET", "/fee-transactions?limit=3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: PaginatedResponse<FeeTransaction> = body_json(response).await;
        assert_eq!(page.items.len(), 3);
        assert!(page.has_more);

        let cursor = page.next_cursor.unwrap();
        let response = app
            .router()
            .oneshot(empty_request(
                "GET",
                &format!("/fee-transactions?limit=3&cursor={cursor}"),
            ))
            .await
            .unwrap();
        let page: PaginatedResponse<FeeTransaction> = body_json(response).await;
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_refund_pending_transaction_conflicts() {
        let app = TestApp::new();
        let created = create_transaction(&app, "trade_1").await;

        let response = app
            .router()
            .oneshot(empty_request(
                "POST",
                &format!("/fee-transactions/{}/refund", created.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let error: Value = body_json(response).await;
        assert_eq!(error["error"]["type"], "invalid_state_transition");
    }

    #[tokio::test]
    async fn test_refund_collected_transaction_twice() {
        let app = TestApp::new();
        let created = create_transaction(&app, "trade_1").await;
        app.state.service.settle(&created.id).await.unwrap();

        for _ in 0..2 {
            let response = app
                .router()
                .oneshot(empty_request(
                    "POST",
                    &format!("/fee-transactions/{}/refund", created.id),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let tx: FeeTransaction = body_json(response).await;
            assert_eq!(tx.status, FeeStatus::Refunded);
            assert_eq!(tx.fee_amount.to_string(), "1.0000000");
        }
        assert_eq!(app.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let app = TestApp::new();
        let created = create_transaction(&app, "trade_1").await;

        let response = app
            .router()
            .oneshot(empty_request(
                "POST",
                &format!("/fee-transactions/{}/retry", created.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_retry_failed_transaction() {
        let app = TestApp::new();
        let created = create_transaction(&app, "trade_1").await;
        app.ledger.push_failure(false, "op_no_destination");
        let failed = app.state.service.settle(&created.id).await.unwrap();
        assert_eq!(failed.status, FeeStatus::Failed);

        let response = app
            .router()
            .oneshot(empty_request(
                "POST",
                &format!("/fee-transactions/{}/retry", created.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let tx: FeeTransaction = body_json(response).await;
        assert_eq!(tx.status, FeeStatus::Pending);
        assert!(tx.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_cancel_scheduled_retry() {
        let mut settings = test_settings();
        settings.retry.backoff_base_ms = 60_000;
        settings.retry.backoff_cap_ms = 60_000;
        let app = TestApp::with_settings(settings);
        let created = create_transaction(&app, "trade_1").await;
        app.ledger.push_failure(true, "tx_bad_seq");
        let failed = app.state.service.settle(&created.id).await.unwrap();
        assert!(failed.next_retry_at.is_some());
        assert!(app.state.service.queue().is_retry_scheduled(&created.id));

        let response = app
            .router()
            .oneshot(empty_request(
                "DELETE",
                &format!("/fee-transactions/{}/scheduled-retry", created.id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let tx: FeeTransaction = body_json(response).await;
        assert_eq!(tx.status, FeeStatus::Failed);
        assert!(tx.next_retry_at.is_none());
        assert!(!app.state.service.queue().is_retry_scheduled(&created.id));
    }
}

mod admin_tests {
    use super::*;

    fn replacement_schedule() -> Value {
        json!({
            "rates": { "standard": "0.0020", "high_volume": "0.0010", "vip": "0.0005" },
            "high_volume_threshold": "50000",
            "promotions": [],
            "unknown_promotion": "fall_back"
        })
    }

    #[tokio::test]
    async fn test_replace_schedule_applies_to_new_quotes() {
        let app = TestApp::new();
        let before = create_transaction(&app, "trade_before").await;

        let response = app
            .router()
            .oneshot(json_request(
                "PUT",
                "/admin/fee-schedule",
                &replacement_schedule(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let schedule: FeeSchedule = body_json(response).await;
        assert_eq!(schedule.rates.standard.to_string(), "0.0020");

        let after = create_transaction(&app, "trade_after").await;
        assert_eq!(after.fee_amount.to_string(), "2.0000000");

        let response = app
            .router()
            .oneshot(empty_request(
                "GET",
                &format!("/fee-transactions/{}", before.id),
            ))
            .await
            .unwrap();
        let unchanged: FeeTransaction = body_json(response).await;
        assert_eq!(unchanged.fee_amount.to_string(), "1.0000000");
    }

    #[tokio::test]
    async fn test_replace_schedule_rejects_duplicate_codes() {
        let app = TestApp::new();
        let mut schedule = replacement_schedule();
        schedule["promotions"] = json!([
            { "code": "A", "rate": "0.0001" },
            { "code": "a", "rate": "0.0002" }
        ]);

        let response = app
            .router()
            .oneshot(json_request("PUT", "/admin/fee-schedule", &schedule))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_token_required_when_configured() {
        let app = TestApp::new().with_admin_token("s3cret");

        let response = app
            .router()
            .oneshot(empty_request("GET", "/admin/fee-schedule"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("GET")
            .uri("/admin/fee-schedule")
            .header("x-admin-token", "wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("GET")
            .uri("/admin/fee-schedule")
            .header("x-admin-token", "s3cret")
            .body(Body::empty())
            .unwrap();
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let schedule: FeeSchedule = body_json(response).await;
        assert_eq!(schedule.promotions[0].code, "LAUNCH");
    }
}

mod health_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_healthy() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(empty_request("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_health_degraded_when_ledger_down() {
        let app = TestApp::new();
        app.ledger.set_healthy(false);

        let response = app
            .router()
            .oneshot(empty_request("GET", "/health"))
            .await
            .unwrap();
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.ledger, HealthStatus::Unhealthy);

        let response = app
            .router()
            .oneshot(empty_request("GET", "/health/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_fails_when_database_down() {
        let app = TestApp::new();
        app.db.set_healthy(false);

        let response = app
            .router()
            .oneshot(empty_request("GET", "/health/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(empty_request("GET", "/health/live"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

mod rate_limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limit_rejects_after_burst() {
        let app = TestApp::new();
        let router = create_router_with_rate_limit(
            Arc::clone(&app.state),
            RateLimitConfig {
                requests_per_second: 1,
                burst_size: 2,
            },
        );

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(empty_request("GET", "/fee-transactions"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .clone()
            .oneshot(empty_request("GET", "/fee-transactions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        let response = router
            .oneshot(empty_request("GET", "/health/live"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
