//! Background purge of old usage rows.
//!
//! Each batch is its own statement and commits on its own, so an interrupted run
//! only loses the batch in flight.

use crate::db::{DbPool, db_time};
use crate::settings::SettingsStore;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub interval: std::time::Duration,
    pub batch_size: i64,
    /// Upper bound on batches per run.
    pub max_batches: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(6 * 60 * 60),
            batch_size: 5000,
            max_batches: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionRunResult {
    pub deleted: u64,
    pub batches: usize,
    /// True when the run stopped at `max_batches` with rows possibly left over.
    pub hit_batch_cap: bool,
}

pub struct RetentionCleaner {
    pool: DbPool,
    settings: SettingsStore,
    config: RetentionConfig,
}

impl RetentionCleaner {
    pub fn new(pool: DbPool, settings: SettingsStore, config: RetentionConfig) -> Self {
        Self {
            pool,
            settings,
            config,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = self.config.interval.as_secs(),
                batch_size = self.config.batch_size,
                "retention cleaner started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
                match self.run_once(Utc::now()).await {
                    Ok(result) if result.deleted > 0 => tracing::info!(
                        deleted = result.deleted,
                        batches = result.batches,
                        hit_batch_cap = result.hit_batch_cap,
                        "retention run complete"
                    ),
                    Ok(_) => tracing::debug!("retention run complete, nothing to delete"),
                    Err(err) => tracing::error!(error = %err, "retention run failed"),
                }
            }
            tracing::info!("retention cleaner stopped");
        })
    }

    /// Deletes usage rows older than `usages_retention_days` before `now`.
    /// A retention of zero or less disables the purge.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionRunResult, String> {
        let days = self.settings.get_all().await?.usages_retention_days;
        let mut result = RetentionRunResult::default();
        if days <= 0 {
            return Ok(result);
        }
        let Some(cutoff) = Duration::try_days(days).and_then(|d| now.checked_sub_signed(d)) else {
            return Err(format!("usages_retention_days out of range: {days}"));
        };
        let cutoff = db_time(cutoff);

        while result.batches < self.config.max_batches {
            let deleted = sqlx::query(
                r#"DELETE FROM usages WHERE id IN (
                       SELECT id FROM usages WHERE requested_at < ?
                       ORDER BY requested_at ASC LIMIT ?
                   )"#,
            )
            .bind(&cutoff)
            .bind(self.config.batch_size)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                format!(
                    "retention batch {} failed after deleting {} rows: {e}",
                    result.batches + 1,
                    result.deleted
                )
            })?
            .rows_affected();
            result.batches += 1;
            if deleted == 0 {
                return Ok(result);
            }
            result.deleted += deleted;
            counter!("proxybill_retention_deleted_total").increment(deleted);
        }
        result.hit_batch_cap = true;
        tracing::warn!(
            deleted = result.deleted,
            max_batches = self.config.max_batches,
            "retention run stopped at batch cap"
        );
        Ok(result)
    }
}
