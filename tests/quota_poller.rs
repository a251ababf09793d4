use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use proxybill::app::{AppState, RuntimeConfig};
use proxybill::auths::Auth;
use proxybill::quota_fetch::{
    HttpQuotaFetcher, QuotaEndpoints, QuotaFetchError, QuotaFetcher, QuotaProvider,
};
use proxybill::quota_poller::{EMPTY_POOL_BACKOFF, QuotaRefreshError};
use proxybill::settings::{QUOTA_POLL_INTERVAL_SECONDS, QUOTA_POLL_MAX_CONCURRENCY};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Hits {
    antigravity_fail: AtomicUsize,
    antigravity_ok: AtomicUsize,
    codex: AtomicUsize,
    gemini: AtomicUsize,
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn start_upstream() -> (SocketAddr, Arc<Hits>) {
    let hits = Arc::new(Hits::default());

    async fn antigravity_fail(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
        hits.antigravity_fail.fetch_add(1, Ordering::SeqCst);
        (StatusCode::SERVICE_UNAVAILABLE, "try another region")
    }

    async fn antigravity_ok(
        State(hits): State<Arc<Hits>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        hits.antigravity_ok.fetch_add(1, Ordering::SeqCst);
        if bearer(&headers) == "dead" {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "expired"}))).into_response();
        }
        Json(json!({"models": {"gemini-3-pro": {"remainingFraction": 0.5}}, "echo": body}))
            .into_response()
    }

    async fn codex(State(hits): State<Arc<Hits>>, headers: HeaderMap) -> impl IntoResponse {
        hits.codex.fetch_add(1, Ordering::SeqCst);
        if bearer(&headers) == "dead" {
            return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "token expired"})))
                .into_response();
        }
        let account = headers
            .get("chatgpt-account-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!({"plan_type": "plus", "account": account})).into_response()
    }

    async fn gemini(
        State(hits): State<Arc<Hits>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        hits.gemini.fetch_add(1, Ordering::SeqCst);
        if bearer(&headers) == "dead" {
            return (StatusCode::FORBIDDEN, "forbidden").into_response();
        }
        if body.get("project").and_then(Value::as_str) == Some("boom") {
            return (StatusCode::INTERNAL_SERVER_ERROR, "backend error").into_response();
        }
        if body.get("project").and_then(Value::as_str) == Some("blank") {
            return (StatusCode::OK, "").into_response();
        }
        Json(json!({"buckets": [{"modelId": "gemini-2.5-pro", "remainingFraction": 1.0}]}))
            .into_response()
    }

    let router = Router::new()
        .route("/antigravity/fail", post(antigravity_fail))
        .route("/antigravity/ok", post(antigravity_ok))
        .route("/codex/usage", get(codex))
        .route("/gemini/quota", post(gemini))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, hits)
}

struct TestContext {
    state: AppState,
    hits: Arc<Hits>,
    _temp_dir: TempDir,
}

fn test_runtime(temp_dir: &TempDir) -> RuntimeConfig {
    RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", temp_dir.path().join("proxybill.db").display()),
        retention_interval: Duration::from_secs(3600),
    }
}

async fn setup() -> TestContext {
    let (addr, hits) = start_upstream().await;
    let base = format!("http://{addr}");
    let fetcher = HttpQuotaFetcher::new(
        reqwest::Client::new(),
        QuotaEndpoints {
            antigravity: vec![
                format!("{base}/antigravity/fail"),
                format!("{base}/antigravity/ok"),
            ],
            codex: format!("{base}/codex/usage"),
            gemini_cli: format!("{base}/gemini/quota"),
        },
    )
    .with_timeout(Duration::from_secs(5));

    let temp_dir = tempfile::tempdir().unwrap();
    let state = proxybill::app::load_state_with(test_runtime(&temp_dir), Arc::new(fetcher))
        .await
        .expect("load state");
    TestContext {
        state,
        hits,
        _temp_dir: temp_dir,
    }
}

fn id_token(account_id: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({"https://api.openai.com/auth": {"chatgpt_account_id": account_id}}).to_string(),
    );
    format!("{header}.{payload}.sig")
}

async fn add_auth(ctx: &TestContext, key: &str, content: Value) -> Auth {
    ctx.state.auth_store.create_auth(key, &content, &[]).await.unwrap()
}

async fn reload(ctx: &TestContext, key: &str) -> Auth {
    ctx.state.auth_store.get_by_key(key).await.unwrap().unwrap()
}

#[tokio::test]
async fn cycle_polls_only_eligible_credentials() {
    let ctx = setup().await;
    let codex = add_auth(
        &ctx,
        "codex-1",
        json!({"type": "codex", "access_token": "tok", "id_token": id_token("acct-1")}),
    )
    .await;
    let gemini = add_auth(
        &ctx,
        "gemini-1",
        json!({"type": "gemini-cli", "access_token": "tok", "metadata": {"project_id": "proj"}}),
    )
    .await;
    let antigravity = add_auth(
        &ctx,
        "ag-1",
        json!({"type": "Antigravity", "access_token": "tok", "project_id": "proj"}),
    )
    .await;
    let runtime = add_auth(
        &ctx,
        "codex-runtime",
        json!({"type": "codex", "access_token": "tok", "id_token": id_token("acct-2"), "runtime_only": "true"}),
    )
    .await;
    add_auth(&ctx, "claude-1", json!({"type": "claude", "access_token": "tok"})).await;

    let summary = ctx
        .state
        .quota_poller
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(summary.eligible, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);

    let codex_quota = ctx.state.auth_store.get_quota(codex.id, "codex").await.unwrap().unwrap();
    assert_eq!(codex_quota["account"], "acct-1");
    assert!(ctx.state.auth_store.get_quota(gemini.id, "gemini-cli").await.unwrap().is_some());
    let ag_quota = ctx
        .state
        .auth_store
        .get_quota(antigravity.id, "antigravity")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ag_quota["echo"]["project"], "proj");
    assert_eq!(ctx.hits.antigravity_fail.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.hits.antigravity_ok.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.hits.codex.load(Ordering::SeqCst), 1);

    assert!(ctx.state.auth_store.get_quota(runtime.id, "codex").await.unwrap().is_none());
    assert!(reload(&ctx, "codex-runtime").await.last_auth_check_at.is_none());
    let checked = reload(&ctx, "codex-1").await;
    assert!(checked.last_auth_check_at.is_some());
    assert!(!checked.token_invalid);
    assert!(checked.last_auth_error.is_none());
}

#[tokio::test]
async fn auth_failures_invalidate_but_server_errors_do_not() {
    let ctx = setup().await;
    add_auth(
        &ctx,
        "codex-dead",
        json!({"type": "codex", "access_token": "dead", "id_token": id_token("acct-1")}),
    )
    .await;
    add_auth(
        &ctx,
        "gemini-flaky",
        json!({"type": "gemini-cli", "access_token": "tok", "project_id": "boom"}),
    )
    .await;
    add_auth(
        &ctx,
        "gemini-forbidden",
        json!({"type": "gemini-cli", "access_token": "dead", "project_id": "proj"}),
    )
    .await;

    let revoked = add_auth(
        &ctx,
        "gemini-revoked",
        json!({"type": "gemini-cli", "access_token": "tok", "project_id": "boom"}),
    )
    .await;
    let earlier = chrono::Utc::now() - chrono::Duration::hours(1);
    ctx.state
        .auth_store
        .record_check_failure(revoked.id, "quota upstream returned 401: expired", true, earlier)
        .await
        .unwrap();

    let summary = ctx
        .state
        .quota_poller
        .run_cycle(&CancellationToken::new())
        .await;
    assert_eq!(summary.failed, 4);

    let dead = reload(&ctx, "codex-dead").await;
    assert!(dead.token_invalid);
    assert!(dead.last_auth_error.as_deref().unwrap().contains("401"));

    let forbidden = reload(&ctx, "gemini-forbidden").await;
    assert!(forbidden.token_invalid);

    let flaky = reload(&ctx, "gemini-flaky").await;
    assert!(!flaky.token_invalid);
    assert!(flaky.last_auth_check_at.is_some());
    assert!(flaky.last_auth_error.as_deref().unwrap().contains("500"));

    // a server error leaves an earlier invalidation in place
    let revoked = reload(&ctx, "gemini-revoked").await;
    assert!(revoked.token_invalid);
    assert!(revoked.last_auth_check_at.unwrap() > earlier);
    assert!(revoked.last_auth_error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn missing_identifiers_fail_without_network_calls() {
    let ctx = setup().await;
    add_auth(&ctx, "codex-no-account", json!({"type": "codex", "access_token": "tok"})).await;
    add_auth(&ctx, "gemini-no-project", json!({"type": "gemini-cli", "access_token": "tok"})).await;

    let err = ctx
        .state
        .quota_poller
        .refresh_by_auth_key("codex-no-account")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuotaRefreshError::Fetch(QuotaFetchError::MissingAccountId)
    ));
    let err = ctx
        .state
        .quota_poller
        .refresh_by_auth_key("gemini-no-project")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuotaRefreshError::Fetch(QuotaFetchError::MissingProjectId)
    ));

    assert_eq!(ctx.hits.codex.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.hits.gemini.load(Ordering::SeqCst), 0);
    let codex = reload(&ctx, "codex-no-account").await;
    assert!(!codex.token_invalid);
    assert!(codex.last_auth_error.is_some());
}

#[tokio::test]
async fn empty_quota_body_is_rejected() {
    let ctx = setup().await;
    let auth = add_auth(
        &ctx,
        "gemini-blank",
        json!({"type": "gemini-cli", "access_token": "tok", "project_id": "blank"}),
    )
    .await;

    let err = ctx
        .state
        .quota_poller
        .refresh_by_auth_key("gemini-blank")
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaRefreshError::Fetch(QuotaFetchError::InvalidBody(_))));
    assert!(ctx.state.auth_store.get_quota(auth.id, "gemini-cli").await.unwrap().is_none());
}

#[tokio::test]
async fn manual_refresh_upserts_and_clears_errors() {
    let ctx = setup().await;
    let auth = add_auth(
        &ctx,
        "ag-manual",
        json!({"type": "antigravity", "access_token": "tok"}),
    )
    .await;
    ctx.state
        .auth_store
        .record_check_failure(auth.id, "previous failure", true, chrono::Utc::now())
        .await
        .unwrap();

    ctx.state
        .quota_poller
        .refresh_by_auth_key("ag-manual")
        .await
        .unwrap();
    ctx.state
        .quota_poller
        .refresh_by_auth_key("ag-manual")
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quota WHERE auth_id = ?")
        .bind(auth.id)
        .fetch_one(&ctx.state.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let refreshed = reload(&ctx, "ag-manual").await;
    assert!(!refreshed.token_invalid);
    assert!(refreshed.last_auth_error.is_none());

    assert!(matches!(
        ctx.state.quota_poller.refresh_by_auth_key("missing").await,
        Err(QuotaRefreshError::AuthNotFound(_))
    ));
}

#[tokio::test]
async fn runtime_only_and_unsupported_credentials_are_refused() {
    let ctx = setup().await;
    add_auth(
        &ctx,
        "rt",
        json!({"type": "antigravity", "access_token": "tok", "runtime_only": true}),
    )
    .await;
    add_auth(&ctx, "claude", json!({"type": "claude", "access_token": "tok"})).await;

    assert!(matches!(
        ctx.state.quota_poller.refresh_by_auth_key("rt").await,
        Err(QuotaRefreshError::RuntimeOnly(_))
    ));
    assert!(matches!(
        ctx.state.quota_poller.refresh_by_auth_key("claude").await,
        Err(QuotaRefreshError::UnsupportedProvider(_))
    ));
    assert_eq!(ctx.hits.antigravity_ok.load(Ordering::SeqCst), 0);
}

struct SlowFetcher {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl QuotaFetcher for SlowFetcher {
    async fn fetch(&self, _provider: QuotaProvider, _auth: &Auth) -> Result<String, QuotaFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(r#"{"ok":true}"#.to_string())
    }
}

async fn setup_with_slow_fetcher() -> (AppState, Arc<SlowFetcher>, TempDir) {
    let fetcher = Arc::new(SlowFetcher {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let temp_dir = tempfile::tempdir().unwrap();
    let state = proxybill::app::load_state_with(test_runtime(&temp_dir), fetcher.clone())
        .await
        .expect("load state");
    for i in 0..6 {
        state
            .auth_store
            .create_auth(&format!("ag-{i}"), &json!({"type": "antigravity"}), &[])
            .await
            .unwrap();
    }
    (state, fetcher, temp_dir)
}

#[tokio::test]
async fn cycle_respects_configured_concurrency() {
    let (state, fetcher, _temp_dir) = setup_with_slow_fetcher().await;
    state
        .settings_store
        .set(QUOTA_POLL_MAX_CONCURRENCY, "2")
        .await
        .unwrap();

    let summary = state.quota_poller.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.succeeded, 6);
    assert_eq!(fetcher.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_cycle_skips_pending_fetches() {
    let (state, fetcher, _temp_dir) = setup_with_slow_fetcher().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = state.quota_poller.run_cycle(&cancel).await;
    assert_eq!(summary.eligible, 6);
    assert_eq!(summary.succeeded + summary.failed, 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn poller_loop_stops_on_cancel() {
    let (state, fetcher, _temp_dir) = setup_with_slow_fetcher().await;
    let cancel = CancellationToken::new();
    let handle = state.quota_poller.clone().start(cancel.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while fetcher.calls.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first cycle ran");
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller stopped")
        .unwrap();
}

#[tokio::test]
async fn empty_pool_backs_off_until_a_credential_is_seen() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(SlowFetcher {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let state = proxybill::app::load_state_with(test_runtime(&temp_dir), fetcher)
        .await
        .expect("load state");
    state
        .settings_store
        .set(QUOTA_POLL_INTERVAL_SECONDS, "60")
        .await
        .unwrap();
    let poller = state.quota_poller.clone();
    let cancel = CancellationToken::new();

    let empty = poller.run_cycle(&cancel).await;
    assert_eq!(empty.eligible, 0);
    assert_eq!(poller.next_wait(&empty).await, EMPTY_POOL_BACKOFF);

    let auth = state
        .auth_store
        .create_auth("ag-0", &json!({"type": "antigravity"}), &[])
        .await
        .unwrap();
    let busy = poller.run_cycle(&cancel).await;
    assert_eq!(busy.eligible, 1);
    assert_eq!(poller.next_wait(&busy).await, Duration::from_secs(60));

    // once a credential has been seen, an emptied pool keeps the normal interval
    sqlx::query("DELETE FROM auths WHERE id = ?")
        .bind(auth.id)
        .execute(&state.pool)
        .await
        .unwrap();
    let emptied = poller.run_cycle(&cancel).await;
    assert_eq!(emptied.eligible, 0);
    assert_eq!(poller.next_wait(&emptied).await, Duration::from_secs(60));
}
