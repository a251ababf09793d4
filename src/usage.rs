use crate::cost::{CostInput, TokenCounts, calculate_cost};
use crate::db::{DbPool, begin_immediate, db_time};
use crate::funding::{deduct_from_bills, deduct_from_prepaid};
use crate::users::user_id_for_api_key;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for recording one usage, including the wait for the write lock.
pub const USAGE_TX_TIMEOUT: Duration = Duration::from_secs(5);

const FALLBACK_ERROR_MESSAGE: &str = "request failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargedTo {
    None,
    Bill,
    Prepaid,
}

impl ChargedTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bill => "bill",
            Self::Prepaid => "prepaid",
        }
    }
}

/// One completed proxy request, as reported by the request pipeline.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub source: String,
    pub auth_key: Option<String>,
    pub auth_index: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub tokens: TokenCounts,
    pub failed: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub variant: Option<String>,
}

impl UsageRecord {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            source: String::new(),
            auth_key: None,
            auth_index: None,
            requested_at: Utc::now(),
            tokens: TokenCounts::default(),
            failed: false,
            status_code: None,
            response_body: None,
            variant: None,
        }
    }
}

/// Caller identity attached to the request by the proxy front end.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMeta {
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub billing_user_group_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageOutcome {
    pub usage_id: i64,
    pub cost_micros: i64,
    pub charged_to: ChargedTo,
}

/// Maps a requested model name onto the canonical name billing rules are written for.
pub trait ModelAliasResolver: Send + Sync {
    fn resolve(&self, provider: &str, model: &str) -> Option<String>;
}

pub struct NoAliases;

impl ModelAliasResolver for NoAliases {
    fn resolve(&self, _provider: &str, _model: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticAliases {
    by_model: HashMap<String, String>,
}

impl StaticAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.by_model
            .insert(alias.into().trim().to_string(), canonical.into().trim().to_string());
        self
    }
}

impl ModelAliasResolver for StaticAliases {
    fn resolve(&self, _provider: &str, model: &str) -> Option<String> {
        self.by_model
            .get(model.trim())
            .filter(|canonical| !canonical.is_empty())
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub status_code: i64,
    pub message: String,
}

pub fn extract_error_message(body: Option<&str>) -> String {
    let body = body.map(str::trim).unwrap_or_default();
    if body.is_empty() {
        return FALLBACK_ERROR_MESSAGE.to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let nested = value.get("error").and_then(|err| match err {
            Value::String(text) => Some(text.as_str()),
            other => other.get("message").and_then(Value::as_str),
        });
        if let Some(message) = nested.or_else(|| value.get("message").and_then(Value::as_str)) {
            let message = message.trim();
            if !message.is_empty() {
                return message.to_string();
            }
        }
    }
    body.to_string()
}

/// Snapshot of a failed request, or `None` for a successful one.
pub fn error_detail_for(record: &UsageRecord) -> Option<ErrorDetail> {
    let status = record.status_code.unwrap_or(0);
    if !record.failed && status < 400 {
        return None;
    }
    Some(ErrorDetail {
        status_code: i64::from(status),
        message: extract_error_message(record.response_body.as_deref()),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredUsage {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub auth_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_group_id: Option<i64>,
    pub auth_group_id: Option<i64>,
    pub cost_micros: i64,
    pub failed: bool,
    pub error_status_code: Option<i64>,
    pub error_detail: Option<String>,
    pub charged_to: String,
    pub variant: Option<String>,
    pub variant_origin: Option<String>,
}

#[derive(Clone)]
pub struct UsageStore {
    pool: Pool<Sqlite>,
}

impl UsageStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                auth_key TEXT,
                auth_index TEXT,
                auth_id INTEGER,
                user_id INTEGER,
                api_key_id INTEGER,
                user_group_id INTEGER,
                auth_group_id INTEGER,
                requested_at TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                reasoning_tokens INTEGER NOT NULL DEFAULT 0,
                cached_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                cost_micros INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                error_status_code INTEGER,
                error_detail TEXT,
                charged_to TEXT NOT NULL DEFAULT 'none',
                variant TEXT,
                variant_origin TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_usages_requested_at ON usages(requested_at)",
            "CREATE INDEX IF NOT EXISTS idx_usages_user_charged ON usages(user_id, charged_to, requested_at)",
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(Self { pool })
    }

    pub async fn get_usage(&self, id: i64) -> Result<Option<StoredUsage>, String> {
        let row = sqlx::query(
            r#"SELECT id, provider, model, auth_id, user_id, user_group_id, auth_group_id,
                      cost_micros, failed, error_status_code, error_detail, charged_to,
                      variant, variant_origin
               FROM usages WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredUsage {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            provider: row.try_get("provider").map_err(|e| e.to_string())?,
            model: row.try_get("model").map_err(|e| e.to_string())?,
            auth_id: row.try_get("auth_id").map_err(|e| e.to_string())?,
            user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
            user_group_id: row.try_get("user_group_id").map_err(|e| e.to_string())?,
            auth_group_id: row.try_get("auth_group_id").map_err(|e| e.to_string())?,
            cost_micros: row.try_get("cost_micros").map_err(|e| e.to_string())?,
            failed: row.try_get("failed").map_err(|e| e.to_string())?,
            error_status_code: row.try_get("error_status_code").map_err(|e| e.to_string())?,
            error_detail: row.try_get("error_detail").map_err(|e| e.to_string())?,
            charged_to: row.try_get("charged_to").map_err(|e| e.to_string())?,
            variant: row.try_get("variant").map_err(|e| e.to_string())?,
            variant_origin: row.try_get("variant_origin").map_err(|e| e.to_string())?,
        }))
    }

    pub async fn count(&self) -> Result<i64, String> {
        sqlx::query_scalar("SELECT COUNT(*) FROM usages")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    pool: DbPool,
    aliases: Arc<dyn ModelAliasResolver>,
}

impl UsageRecorder {
    pub fn new(pool: DbPool, aliases: Arc<dyn ModelAliasResolver>) -> Self {
        Self { pool, aliases }
    }

    /// Fire-and-forget variant for the request path.
    pub fn spawn_handle_usage(&self, record: UsageRecord, meta: RequestMeta) {
        let recorder = self.clone();
        tokio::spawn(async move {
            recorder.handle_usage(record, meta).await;
        });
    }

    /// Records one request and charges its cost. Failures are logged and the
    /// record is dropped; `None` means nothing was persisted.
    pub async fn handle_usage(&self, record: UsageRecord, meta: RequestMeta) -> Option<UsageOutcome> {
        let deadline = Instant::now() + USAGE_TX_TIMEOUT;
        let mut tx = match tokio::time::timeout_at(deadline, begin_immediate(&self.pool)).await {
            Ok(Ok(tx)) => tx,
            Ok(Err(err)) => {
                drop_usage(&record, &format!("begin transaction failed: {err}"));
                return None;
            }
            Err(_) => {
                drop_usage(&record, "timed out waiting for write lock");
                return None;
            }
        };

        let written = tokio::time::timeout_at(
            deadline,
            write_usage(&mut *tx, self.aliases.as_ref(), &record, &meta),
        )
        .await;
        let outcome = match written {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                rollback_quietly(tx).await;
                drop_usage(&record, &err);
                return None;
            }
            Err(_) => {
                rollback_quietly(tx).await;
                drop_usage(&record, "usage transaction timed out");
                return None;
            }
        };
        if let Err(err) = tx.commit().await {
            drop_usage(&record, &format!("commit failed: {err}"));
            return None;
        }

        counter!("proxybill_usage_recorded_total", "charged_to" => outcome.charged_to.as_str())
            .increment(1);
        tracing::debug!(
            usage_id = outcome.usage_id,
            cost_micros = outcome.cost_micros,
            charged_to = outcome.charged_to.as_str(),
            model = %record.model,
            "usage recorded"
        );
        Some(outcome)
    }
}

async fn rollback_quietly(tx: Transaction<'static, Sqlite>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "usage rollback failed");
    }
}

fn drop_usage(record: &UsageRecord, reason: &str) {
    counter!("proxybill_usage_dropped_total").increment(1);
    tracing::warn!(
        provider = %record.provider,
        model = %record.model,
        auth_key = ?record.auth_key,
        "usage dropped: {reason}"
    );
}

async fn resolve_auth_id(
    conn: &mut SqliteConnection,
    auth_key: Option<&str>,
) -> Result<Option<i64>, String> {
    let Some(key) = auth_key.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    sqlx::query_scalar::<_, i64>("SELECT id FROM auths WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| e.to_string())
}

async fn write_usage(
    conn: &mut SqliteConnection,
    aliases: &dyn ModelAliasResolver,
    record: &UsageRecord,
    meta: &RequestMeta,
) -> Result<UsageOutcome, String> {
    let auth_id = resolve_auth_id(conn, record.auth_key.as_deref())
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(auth_key = ?record.auth_key, "auth lookup failed: {err}");
            None
        });

    let requested_model = record.model.trim().to_string();
    let (model, variant_origin) = match aliases.resolve(&record.provider, &requested_model) {
        Some(canonical) if canonical != requested_model => (canonical, Some(requested_model)),
        _ => (requested_model, None),
    };

    let user_id = match meta.user_id {
        Some(id) => Some(id),
        None => match meta.api_key_id {
            Some(key_id) => user_id_for_api_key(conn, key_id).await.unwrap_or_else(|err| {
                tracing::warn!(api_key_id = key_id, "api key owner lookup failed: {err}");
                None
            }),
            None => None,
        },
    };

    let cost = calculate_cost(
        conn,
        &CostInput {
            provider: record.provider.clone(),
            model: model.clone(),
            tokens: record.tokens,
            failed: record.failed,
            auth_id,
            user_id,
            api_key_id: meta.api_key_id,
            billing_user_group_id: meta.billing_user_group_id,
        },
    )
    .await;

    let error_detail = error_detail_for(record);
    let error_detail_json = error_detail
        .as_ref()
        .map(|detail| serde_json::to_string(detail).map_err(|e| e.to_string()))
        .transpose()?;

    let inserted = sqlx::query(
        r#"INSERT INTO usages
           (provider, model, source, auth_key, auth_index, auth_id, user_id, api_key_id,
            user_group_id, auth_group_id, requested_at, input_tokens, output_tokens,
            reasoning_tokens, cached_tokens, total_tokens, cost_micros, failed,
            error_status_code, error_detail, charged_to, variant, variant_origin, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'none', ?, ?, ?)"#,
    )
    .bind(&record.provider)
    .bind(&model)
    .bind(&record.source)
    .bind(&record.auth_key)
    .bind(&record.auth_index)
    .bind(auth_id)
    .bind(user_id)
    .bind(meta.api_key_id)
    .bind(cost.user_group_id)
    .bind(cost.auth_group_id)
    .bind(db_time(record.requested_at))
    .bind(record.tokens.input_tokens)
    .bind(record.tokens.output_tokens)
    .bind(record.tokens.reasoning_tokens)
    .bind(record.tokens.cached_tokens)
    .bind(record.tokens.total_tokens)
    .bind(cost.cost_micros)
    .bind(record.failed)
    .bind(error_detail.as_ref().map(|d| d.status_code))
    .bind(error_detail_json)
    .bind(&record.variant)
    .bind(&variant_origin)
    .bind(db_time(Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| e.to_string())?;
    let usage_id = inserted.last_insert_rowid();

    let mut charged_to = ChargedTo::None;
    if let (Some(user_id), true) = (user_id, cost.cost_micros > 0) {
        let now = Utc::now();
        if deduct_from_bills(conn, user_id, cost.user_group_id, cost.cost_micros, now)
            .await
            .map_err(|e| e.to_string())?
        {
            charged_to = ChargedTo::Bill;
        } else if deduct_from_prepaid(conn, user_id, cost.user_group_id, cost.cost_micros, now)
            .await
            .map_err(|e| e.to_string())?
        {
            charged_to = ChargedTo::Prepaid;
        }
    }

    if charged_to != ChargedTo::None {
        sqlx::query("UPDATE usages SET charged_to = ? WHERE id = ?")
            .bind(charged_to.as_str())
            .bind(usage_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| e.to_string())?;
    } else if cost.cost_micros > 0 {
        tracing::info!(usage_id, ?user_id, cost_micros = cost.cost_micros, "usage left uncharged");
    }

    Ok(UsageOutcome {
        usage_id,
        cost_micros: cost.cost_micros,
        charged_to,
    })
}
