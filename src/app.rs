use crate::auths::AuthStore;
use crate::billing_rules::BillingRuleStore;
use crate::db::{DbPool, open_pool};
use crate::error::{AppError, AppResult};
use crate::funding::FundingStore;
use crate::groups::GroupStore;
use crate::quota_fetch::{HttpQuotaFetcher, QuotaEndpoints, QuotaFetcher};
use crate::quota_poller::QuotaPoller;
use crate::refresh_tasks::RefreshTaskStore;
use crate::retention::{RetentionCleaner, RetentionConfig};
use crate::settings::SettingsStore;
use crate::usage::{NoAliases, UsageRecorder, UsageStore};
use crate::users::UserStore;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub pool: DbPool,
    pub metrics: PrometheusHandle,
    pub settings_store: SettingsStore,
    pub group_store: GroupStore,
    pub user_store: UserStore,
    pub auth_store: AuthStore,
    pub billing_rule_store: BillingRuleStore,
    pub funding_store: FundingStore,
    pub usage_store: UsageStore,
    pub usage_recorder: UsageRecorder,
    pub quota_poller: Arc<QuotaPoller>,
    pub retention: Arc<RetentionCleaner>,
    pub refresh_tasks: RefreshTaskStore,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub retention_interval: Duration,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("PROXYBILL_LISTEN").unwrap_or_else(|| "0.0.0.0:8318".to_string());
        let metrics_path =
            env_non_empty("PROXYBILL_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = env_non_empty("PROXYBILL_DATABASE_DSN")
            .or_else(|| env_non_empty("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/proxybill.db".to_string());
        let retention_interval = env_non_empty("PROXYBILL_RETENTION_INTERVAL_SECONDS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| RetentionConfig::default().interval);
        Self {
            listen,
            metrics_path,
            database_dsn,
            retention_interval,
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn store_error(code: &'static str) -> impl Fn(String) -> AppError {
    move |err| AppError::internal(code, err)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("proxybill/0.1")
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;
    let fetcher = HttpQuotaFetcher::new(http, QuotaEndpoints::default());
    load_state_with(runtime, Arc::new(fetcher)).await
}

/// Builds the state around a caller-supplied quota fetcher.
pub async fn load_state_with(
    runtime: RuntimeConfig,
    fetcher: Arc<dyn QuotaFetcher>,
) -> AppResult<AppState> {
    let pool = open_pool(&runtime.database_dsn).await.map_err(store_error("database_init_failed"))?;

    let settings_store = SettingsStore::new(pool.clone())
        .await
        .map_err(store_error("settings_store_init_failed"))?;
    let group_store = GroupStore::new(pool.clone())
        .await
        .map_err(store_error("group_store_init_failed"))?;
    let user_store = UserStore::new(pool.clone())
        .await
        .map_err(store_error("user_store_init_failed"))?;
    let auth_store = AuthStore::new(pool.clone())
        .await
        .map_err(store_error("auth_store_init_failed"))?;
    let billing_rule_store = BillingRuleStore::new(pool.clone())
        .await
        .map_err(store_error("billing_rule_store_init_failed"))?;
    let funding_store = FundingStore::new(pool.clone())
        .await
        .map_err(store_error("funding_store_init_failed"))?;
    let usage_store = UsageStore::new(pool.clone())
        .await
        .map_err(store_error("usage_store_init_failed"))?;

    let metrics = init_metrics()?;
    let usage_recorder = UsageRecorder::new(pool.clone(), Arc::new(NoAliases));
    let quota_poller = Arc::new(QuotaPoller::new(
        auth_store.clone(),
        settings_store.clone(),
        fetcher,
    ));
    let retention = Arc::new(RetentionCleaner::new(
        pool.clone(),
        settings_store.clone(),
        RetentionConfig {
            interval: runtime.retention_interval,
            ..RetentionConfig::default()
        },
    ));

    Ok(AppState {
        runtime: Arc::new(runtime),
        pool,
        metrics,
        settings_store,
        group_store,
        user_store,
        auth_store,
        billing_rule_store,
        funding_store,
        usage_store,
        usage_recorder,
        quota_poller,
        retention,
        refresh_tasks: RefreshTaskStore::default(),
    })
}

/// Starts the quota poller and the retention cleaner; both stop when `cancel` fires.
pub fn spawn_background_workers(state: &AppState, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        state.quota_poller.clone().start(cancel.clone()),
        state.retention.clone().start(cancel.clone()),
    ]
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics_init_failed", "metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/healthz", get(crate::handlers::healthz))
        .route(&metrics_path, get(crate::handlers::metrics))
        .nest("/api", build_quota_api_router())
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_quota_api_router() -> Router<AppState> {
    Router::new()
        .route("/quota/refresh", post(crate::handlers::start_quota_refresh))
        .route(
            "/quota/refresh/{task_id}",
            get(crate::handlers::get_quota_refresh),
        )
        .route(
            "/quota/refresh/auth/{auth_key}",
            post(crate::handlers::refresh_auth_quota),
        )
}
