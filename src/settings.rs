use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

pub const QUOTA_POLL_INTERVAL_SECONDS: &str = "quota_poll_interval_seconds";
pub const QUOTA_POLL_MAX_CONCURRENCY: &str = "quota_poll_max_concurrency";
pub const USAGES_RETENTION_DAYS: &str = "usages_retention_days";

/// Upper bound on concurrent upstream quota fetches, whatever the setting says.
pub const QUOTA_POLL_MAX_CONCURRENCY_CEILING: u32 = 5;
pub const QUOTA_POLL_MIN_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub quota_poll_interval_seconds: u64,
    pub quota_poll_max_concurrency: u32,
    pub usages_retention_days: i64,
    pub updated_at: DateTime<Utc>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            quota_poll_interval_seconds: 300,
            quota_poll_max_concurrency: 3,
            usages_retention_days: 0,
            updated_at: Utc::now(),
        }
    }
}

impl SystemSettings {
    pub fn poll_interval_seconds(&self) -> u64 {
        self.quota_poll_interval_seconds
            .max(QUOTA_POLL_MIN_INTERVAL_SECONDS)
    }

    pub fn poll_max_concurrency(&self) -> usize {
        self.quota_poll_max_concurrency
            .clamp(1, QUOTA_POLL_MAX_CONCURRENCY_CEILING) as usize
    }
}

/// Reads a numeric setting stored as a JSON number, a numeric string, or a
/// `{"value": ...}` wrapper around either.
pub fn parse_setting_number(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => number_from_value(&value),
        Err(_) => parse_numeric_str(trimmed),
    }
}

fn number_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => parse_numeric_str(s.trim()),
        Value::Object(map) => map.get("value").and_then(number_from_value),
        _ => None,
    }
}

fn parse_numeric_str(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64)
    })
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Sqlite>,
}

impl SettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.ensure_defaults().await?;
        Ok(store)
    }

    async fn ensure_defaults(&self) -> Result<(), String> {
        let defaults = SystemSettings::default();
        self.set_if_not_exists(
            QUOTA_POLL_INTERVAL_SECONDS,
            &defaults.quota_poll_interval_seconds.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            QUOTA_POLL_MAX_CONCURRENCY,
            &defaults.quota_poll_max_concurrency.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            USAGES_RETENTION_DAYS,
            &defaults.usages_retention_days.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(row.map(|r| r.try_get("value").unwrap_or_default()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Fresh snapshot of every known setting. Unparseable values fall back to defaults.
    pub async fn get_all(&self) -> Result<SystemSettings, String> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM system_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut settings = SystemSettings::default();
        let defaults = SystemSettings::default();
        let mut latest_update = settings.updated_at;

        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            let updated_at_str: String = row.try_get("updated_at").map_err(|e| e.to_string())?;

            if let Ok(updated_at) = DateTime::parse_from_rfc3339(&updated_at_str) {
                let updated_at = updated_at.with_timezone(&Utc);
                if updated_at > latest_update {
                    latest_update = updated_at;
                }
            }

            match key.as_str() {
                QUOTA_POLL_INTERVAL_SECONDS => {
                    settings.quota_poll_interval_seconds = parse_setting_number(&value)
                        .and_then(|v| u64::try_from(v).ok())
                        .unwrap_or(defaults.quota_poll_interval_seconds);
                }
                QUOTA_POLL_MAX_CONCURRENCY => {
                    settings.quota_poll_max_concurrency = parse_setting_number(&value)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(defaults.quota_poll_max_concurrency);
                }
                USAGES_RETENTION_DAYS => {
                    settings.usages_retention_days = parse_setting_number(&value)
                        .unwrap_or(defaults.usages_retention_days);
                }
                _ => {}
            }
        }

        settings.updated_at = latest_update;
        Ok(settings)
    }
}
