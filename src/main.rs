//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use ed25519_dalek::SigningKey;
use secrecy::SecretString;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fee_settlement::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use fee_settlement::app::{AppState, CrankConfig, WorkerConfig, spawn_crank, spawn_worker};
use fee_settlement::domain::ConfigProvider;
use fee_settlement::infra::{
    HorizonLedgerClient, InMemoryConfigProvider, LedgerClientConfig, PostgresClient,
    PostgresConfig, settings_from_env, signing_key_from_base64,
};

/// Process configuration
struct Config {
    database_url: String,
    ledger_gateway_url: String,
    signing_key: Option<SigningKey>,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    enable_background_worker: bool,
    worker_config: WorkerConfig,
    enable_stale_crank: bool,
    crank_config: CrankConfig,
    admin_token: Option<SecretString>,
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let ledger_gateway_url =
            env::var("LEDGER_GATEWAY_URL").context("LEDGER_GATEWAY_URL not set")?;
        let signing_key = Self::load_signing_key()?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_number("PORT", 3000);

        let enable_background_worker = env_flag("ENABLE_BACKGROUND_WORKER", true);
        let worker_config = WorkerConfig {
            enabled: enable_background_worker,
            max_concurrent_jobs: env_number("WORKER_MAX_CONCURRENT_JOBS", 8),
            retry_scan_interval: Duration::from_secs(env_number("WORKER_RETRY_SCAN_SECS", 30)),
            ..Default::default()
        };

        let crank_config = CrankConfig {
            enabled: true,
            poll_interval: Duration::from_secs(env_number("CRANK_POLL_INTERVAL_SECS", 60)),
            stale_after_secs: env_number("CRANK_STALE_AFTER_SECS", 120),
            batch_size: env_number("CRANK_BATCH_SIZE", 20),
        };

        let admin_token = env::var("ADMIN_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);

        Ok(Self {
            database_url,
            ledger_gateway_url,
            signing_key,
            host,
            port,
            enable_rate_limiting: env_flag("ENABLE_RATE_LIMITING", false),
            rate_limit_config: RateLimitConfig::from_env(),
            enable_background_worker,
            worker_config,
            enable_stale_crank: env_flag("ENABLE_STALE_CRANK", true),
            crank_config,
            admin_token,
        })
    }

    fn load_signing_key() -> Result<Option<SigningKey>> {
        let Some(key_str) = env::var("LEDGER_SIGNING_KEY").ok().filter(|k| !k.is_empty()) else {
            warn!("LEDGER_SIGNING_KEY not set, ledger requests will be unsigned");
            return Ok(None);
        };
        let secret = SecretString::from(key_str);
        let key = signing_key_from_base64(&secret)
            .context("Failed to parse LEDGER_SIGNING_KEY as base64")?;
        Ok(Some(key))
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let json_logs = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    init_tracing(json_logs);

    info!("Fee settlement service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let settings = settings_from_env().context("Invalid settlement configuration")?;
    info!(
        standard = %settings.fee_schedule.rates.standard,
        high_volume = %settings.fee_schedule.rates.high_volume,
        vip = %settings.fee_schedule.rates.vip,
        threshold = %settings.fee_schedule.high_volume_threshold,
        promotions = settings.fee_schedule.promotions.len(),
        max_retries = settings.retry.max_retries,
        "Settlement settings loaded"
    );
    let submission_timeout = settings.submission_timeout();
    let config_provider: Arc<dyn ConfigProvider> = Arc::new(InMemoryConfigProvider::new(settings)?);

    let postgres_client = PostgresClient::new(&config.database_url, PostgresConfig::default()).await?;
    postgres_client.run_migrations().await?;
    info!("Database connected and migrations applied");

    let ledger_client = HorizonLedgerClient::new(
        &config.ledger_gateway_url,
        config.signing_key.clone(),
        LedgerClientConfig {
            timeout: submission_timeout,
        },
    )?;
    if let Some(public_key) = ledger_client.public_key() {
        info!(public_key = %public_key, "Ledger client signing requests");
    }

    let (app_state, jobs) = AppState::new(
        Arc::new(postgres_client),
        Arc::new(ledger_client),
        config_provider,
    );
    let app_state = match config.admin_token.clone() {
        Some(token) => app_state.with_admin_token(token),
        None => {
            warn!("ADMIN_API_TOKEN not set, admin endpoints are unauthenticated");
            app_state
        }
    };
    let app_state = Arc::new(app_state);

    let worker_shutdown_tx = if config.enable_background_worker {
        let (_handle, shutdown_tx) = spawn_worker(
            Arc::clone(&app_state.service),
            jobs,
            config.worker_config.clone(),
        );
        info!("Settlement worker started");
        Some(shutdown_tx)
    } else {
        warn!("Settlement worker disabled, fee transactions will stay PENDING");
        drop(jobs);
        None
    };

    let crank_shutdown_tx = if config.enable_stale_crank && config.enable_background_worker {
        let (_handle, shutdown_tx) =
            spawn_crank(Arc::clone(&app_state.service), config.crank_config.clone());
        info!(
            poll_secs = config.crank_config.poll_interval.as_secs(),
            stale_after_secs = config.crank_config.stale_after_secs,
            "Stale transaction crank started"
        );
        Some(shutdown_tx)
    } else {
        info!("Stale transaction crank disabled");
        None
    };

    let router = if config.enable_rate_limiting {
        create_router_with_rate_limit(app_state, config.rate_limit_config)
    } else {
        create_router(app_state)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Swagger UI available at http://{}/swagger-ui", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tx) = worker_shutdown_tx {
        let _ = tx.send(true);
    }
    if let Some(tx) = crank_shutdown_tx {
        let _ = tx.send(true);
    }

    info!("Server shutdown complete");
    Ok(())
}
