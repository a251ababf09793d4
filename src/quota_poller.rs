use crate::auths::{Auth, AuthStore};
use crate::quota_fetch::{QuotaFetchError, QuotaFetcher, QuotaProvider};
use crate::settings::{SettingsStore, SystemSettings};
use chrono::Utc;
use futures_util::future::join_all;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wait used while no credential has ever been seen, so new ones are picked up quickly.
pub const EMPTY_POOL_BACKOFF: Duration = Duration::from_secs(10);

/// Longest error message kept in `auths.last_auth_error`.
pub const MAX_AUTH_ERROR_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum QuotaRefreshError {
    #[error("auth not found: {0}")]
    AuthNotFound(String),
    #[error("provider {0:?} does not report quota")]
    UnsupportedProvider(Option<String>),
    #[error("auth {0} is runtime-only")]
    RuntimeOnly(String),
    #[error(transparent)]
    Fetch(#[from] QuotaFetchError),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub eligible: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The credential's quota provider, if it is one the poller manages.
pub fn eligible_provider(auth: &Auth) -> Option<QuotaProvider> {
    if auth.runtime_only() {
        return None;
    }
    auth.provider().as_deref().and_then(QuotaProvider::from_str)
}

pub struct QuotaPoller {
    auths: AuthStore,
    settings: SettingsStore,
    fetcher: Arc<dyn QuotaFetcher>,
    seen_credentials: AtomicBool,
}

impl QuotaPoller {
    pub fn new(auths: AuthStore, settings: SettingsStore, fetcher: Arc<dyn QuotaFetcher>) -> Self {
        Self {
            auths,
            settings,
            fetcher,
            seen_credentials: AtomicBool::new(false),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("quota poller started");
            loop {
                let summary = self.run_cycle(&cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
                let wait = self.next_wait(&summary).await;
                tracing::debug!(
                    eligible = summary.eligible,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    wait_seconds = wait.as_secs(),
                    "quota poll cycle finished"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            tracing::info!("quota poller stopped");
        })
    }

    /// Delay before the next cycle: a short backoff until some credential has been
    /// seen, the configured interval from then on.
    pub async fn next_wait(&self, summary: &CycleSummary) -> Duration {
        if summary.eligible == 0 && !self.seen_credentials.load(Ordering::Relaxed) {
            return EMPTY_POOL_BACKOFF;
        }
        Duration::from_secs(self.load_settings().await.poll_interval_seconds())
    }

    async fn load_settings(&self) -> SystemSettings {
        self.settings.get_all().await.unwrap_or_else(|err| {
            tracing::warn!("failed to load settings, using defaults: {err}");
            SystemSettings::default()
        })
    }

    /// Polls every eligible credential once, at most `quota_poll_max_concurrency` at a time.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let settings = self.load_settings().await;
        let auths = match self.auths.list_auths().await {
            Ok(auths) => auths,
            Err(err) => {
                tracing::warn!("failed to list auths for quota polling: {err}");
                return CycleSummary::default();
            }
        };
        let eligible: Vec<(Auth, QuotaProvider)> = auths
            .into_iter()
            .filter_map(|auth| eligible_provider(&auth).map(|provider| (auth, provider)))
            .collect();
        if !eligible.is_empty() {
            self.seen_credentials.store(true, Ordering::Relaxed);
        }

        let semaphore = Semaphore::new(settings.poll_max_concurrency());
        let attempts = eligible.iter().map(|(auth, provider)| {
            let semaphore = &semaphore;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire() => permit.ok()?,
                };
                Some(self.poll_auth(auth, *provider).await.is_ok())
            }
        });
        let results = join_all(attempts).await;

        CycleSummary {
            eligible: eligible.len(),
            succeeded: results.iter().filter(|r| **r == Some(true)).count(),
            failed: results.iter().filter(|r| **r == Some(false)).count(),
        }
    }

    /// Manual refresh of one credential through the same fetch and health path.
    pub async fn refresh_by_auth_key(&self, auth_key: &str) -> Result<(), QuotaRefreshError> {
        let auth = self
            .auths
            .get_by_key(auth_key)
            .await
            .map_err(QuotaRefreshError::Store)?
            .ok_or_else(|| QuotaRefreshError::AuthNotFound(auth_key.to_string()))?;
        if auth.runtime_only() {
            return Err(QuotaRefreshError::RuntimeOnly(auth_key.to_string()));
        }
        let provider = auth
            .provider()
            .as_deref()
            .and_then(QuotaProvider::from_str)
            .ok_or_else(|| QuotaRefreshError::UnsupportedProvider(auth.provider()))?;
        self.poll_auth(&auth, provider).await
    }

    async fn poll_auth(&self, auth: &Auth, provider: QuotaProvider) -> Result<(), QuotaRefreshError> {
        let result = match self.fetcher.fetch(provider, auth).await {
            Ok(body) => self
                .auths
                .upsert_quota(auth.id, provider.as_str(), &body)
                .await
                .map_err(QuotaRefreshError::Store),
            Err(err) => Err(QuotaRefreshError::Fetch(err)),
        };

        let now = Utc::now();
        let health = match &result {
            Ok(()) => self.auths.record_check_success(auth.id, now).await,
            Err(err) => {
                let invalidate = matches!(err, QuotaRefreshError::Fetch(e) if e.invalidates_credential());
                self.auths
                    .record_check_failure(auth.id, &truncate_error(&err.to_string()), invalidate, now)
                    .await
            }
        };
        if let Err(err) = health {
            tracing::warn!(auth_id = auth.id, "failed to update auth health: {err}");
        }

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!("proxybill_quota_fetch_total", "provider" => provider.as_str(), "outcome" => outcome)
            .increment(1);
        match &result {
            Ok(()) => tracing::debug!(auth_id = auth.id, provider = provider.as_str(), "quota refreshed"),
            Err(err) => tracing::warn!(
                auth_id = auth.id,
                provider = provider.as_str(),
                "quota refresh failed: {err}"
            ),
        }
        result
    }
}

fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_AUTH_ERROR_CHARS) {
        Some((end, _)) => format!("{}...", &message[..end]),
        None => message.to_string(),
    }
}
