use crate::quota_poller::QuotaPoller;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_TASK_TTL_SECONDS: i64 = 3600;
pub const DEFAULT_REFRESH_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTaskStatus {
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshTaskError {
    pub auth_key: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshTask {
    pub id: String,
    pub status: RefreshTaskStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<RefreshTaskError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RefreshTask {
    fn finish(&mut self) {
        self.status = match (self.succeeded, self.failed) {
            (_, 0) => RefreshTaskStatus::Succeeded,
            (0, _) => RefreshTaskStatus::Failed,
            _ => RefreshTaskStatus::PartiallyFailed,
        };
        self.finished_at = Some(Utc::now());
    }
}

/// In-memory progress of admin-triggered batch quota refreshes. Entries expire after the TTL.
#[derive(Clone)]
pub struct RefreshTaskStore {
    tasks: Arc<DashMap<String, RefreshTask>>,
    ttl: Duration,
    workers: usize,
}

impl Default for RefreshTaskStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TASK_TTL_SECONDS), DEFAULT_REFRESH_WORKERS)
    }
}

impl RefreshTaskStore {
    pub fn new(ttl: Duration, workers: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            ttl,
            workers: workers.max(1),
        }
    }

    fn evict_expired(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.tasks.retain(|_, task| task.created_at > cutoff);
    }

    pub fn get(&self, id: &str) -> Option<RefreshTask> {
        self.evict_expired();
        self.tasks.get(id).map(|task| task.clone())
    }

    /// Registers a task and refreshes the given credentials in the background.
    pub fn start_batch(&self, poller: Arc<QuotaPoller>, auth_keys: Vec<String>) -> RefreshTask {
        self.evict_expired();

        let mut seen = HashSet::new();
        let keys: Vec<String> = auth_keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();

        let mut task = RefreshTask {
            id: uuid::Uuid::new_v4().to_string(),
            status: RefreshTaskStatus::Running,
            total: keys.len(),
            succeeded: 0,
            failed: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        if keys.is_empty() {
            task.finish();
            self.tasks.insert(task.id.clone(), task.clone());
            return task;
        }
        self.tasks.insert(task.id.clone(), task.clone());

        let tasks = self.tasks.clone();
        let task_id = task.id.clone();
        let workers = self.workers;
        tokio::spawn(async move {
            let mut results = stream::iter(keys)
                .map(|key| {
                    let poller = poller.clone();
                    async move {
                        let result = poller.refresh_by_auth_key(&key).await;
                        (key, result)
                    }
                })
                .buffer_unordered(workers);

            while let Some((key, result)) = results.next().await {
                let Some(mut entry) = tasks.get_mut(&task_id) else {
                    continue;
                };
                match result {
                    Ok(()) => entry.succeeded += 1,
                    Err(err) => {
                        entry.failed += 1;
                        entry.errors.push(RefreshTaskError {
                            auth_key: key,
                            message: err.to_string(),
                        });
                    }
                }
            }

            if let Some(mut entry) = tasks.get_mut(&task_id) {
                entry.finish();
                tracing::info!(
                    task_id = %task_id,
                    total = entry.total,
                    succeeded = entry.succeeded,
                    failed = entry.failed,
                    "quota refresh batch finished"
                );
            }
        });

        task
    }
}
