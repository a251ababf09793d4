use crate::db::{db_time, encode_id_set, parse_db_time, parse_id_set};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

/// An upstream provider credential managed by the proxy.
#[derive(Debug, Clone, Serialize)]
pub struct Auth {
    pub id: i64,
    pub key: String,
    pub content: Value,
    pub auth_group_ids: Vec<i64>,
    pub token_invalid: bool,
    pub last_auth_check_at: Option<DateTime<Utc>>,
    pub last_auth_error: Option<String>,
}

impl Auth {
    pub fn provider(&self) -> Option<String> {
        self.content
            .get("type")
            .and_then(Value::as_str)
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    /// Credentials provisioned outside the managed pool carry `runtime_only`.
    pub fn runtime_only(&self) -> bool {
        match self.content.get("runtime_only") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => raw.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Looks a string field up in the credential, then in its `metadata` object.
    pub fn content_str(&self, field: &str) -> Option<&str> {
        let direct = self.content.get(field).and_then(Value::as_str);
        let nested = || {
            self.content
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(Value::as_str)
        };
        direct
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| nested().map(str::trim).filter(|v| !v.is_empty()))
    }

    pub fn access_token(&self) -> Option<&str> {
        self.content_str("access_token")
    }

    pub fn project_id(&self) -> Option<&str> {
        self.content_str("project_id")
    }

    pub fn id_token(&self) -> Option<&str> {
        self.content_str("id_token")
    }
}

#[derive(Clone)]
pub struct AuthStore {
    pool: Pool<Sqlite>,
}

impl AuthStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS auths (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL DEFAULT '{}',
                auth_group_id TEXT NOT NULL DEFAULT '[]',
                token_invalid INTEGER NOT NULL DEFAULT 0,
                last_auth_check_at TEXT,
                last_auth_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quota (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                auth_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(auth_id, type)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_auth(
        &self,
        key: &str,
        content: &Value,
        auth_group_ids: &[i64],
    ) -> Result<Auth, String> {
        let now = db_time(Utc::now());
        let content = serde_json::to_string(content).map_err(|e| e.to_string())?;
        sqlx::query(
            "INSERT INTO auths (key, content, auth_group_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(content)
        .bind(encode_id_set(auth_group_ids))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_by_key(key)
            .await?
            .ok_or_else(|| "auth not found after create".to_string())
    }

    pub async fn list_auths(&self) -> Result<Vec<Auth>, String> {
        let rows = sqlx::query(&format!("{AUTH_COLUMNS} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_auth).collect()
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Option<Auth>, String> {
        let row = sqlx::query(&format!("{AUTH_COLUMNS} WHERE key = ?"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_auth).transpose()
    }

    pub async fn record_check_success(&self, auth_id: i64, at: DateTime<Utc>) -> Result<(), String> {
        let at = db_time(at);
        sqlx::query(
            r#"UPDATE auths SET last_auth_check_at = ?, token_invalid = 0, last_auth_error = NULL,
               updated_at = ? WHERE id = ?"#,
        )
        .bind(&at)
        .bind(&at)
        .bind(auth_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Stores the failure; `token_invalid` is only raised, never cleared, here.
    pub async fn record_check_failure(
        &self,
        auth_id: i64,
        message: &str,
        invalidate: bool,
        at: DateTime<Utc>,
    ) -> Result<(), String> {
        let at = db_time(at);
        sqlx::query(
            r#"UPDATE auths SET last_auth_check_at = ?, last_auth_error = ?,
               token_invalid = CASE WHEN ? THEN 1 ELSE token_invalid END,
               updated_at = ? WHERE id = ?"#,
        )
        .bind(&at)
        .bind(message)
        .bind(invalidate)
        .bind(&at)
        .bind(auth_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Saves a provider quota snapshot. The body must be non-empty JSON.
    pub async fn upsert_quota(&self, auth_id: i64, quota_type: &str, body: &str) -> Result<(), String> {
        let body = body.trim();
        if body.is_empty() {
            return Err("empty quota body".to_string());
        }
        serde_json::from_str::<Value>(body).map_err(|e| format!("invalid quota body: {e}"))?;
        sqlx::query(
            r#"INSERT INTO quota (auth_id, type, data, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(auth_id, type) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"#,
        )
        .bind(auth_id)
        .bind(quota_type)
        .bind(body)
        .bind(db_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_quota(&self, auth_id: i64, quota_type: &str) -> Result<Option<Value>, String> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT data FROM quota WHERE auth_id = ? AND type = ?")
                .bind(auth_id)
                .bind(quota_type)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        raw.map(|v| serde_json::from_str(&v).map_err(|e| e.to_string()))
            .transpose()
    }
}

const AUTH_COLUMNS: &str = r#"SELECT id, key, content, auth_group_id, token_invalid,
       last_auth_check_at, last_auth_error FROM auths"#;

fn row_to_auth(row: &sqlx::sqlite::SqliteRow) -> Result<Auth, String> {
    let content: String = row.try_get("content").map_err(|e| e.to_string())?;
    let checked_at: Option<String> = row.try_get("last_auth_check_at").map_err(|e| e.to_string())?;
    Ok(Auth {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        key: row.try_get("key").map_err(|e| e.to_string())?,
        content: serde_json::from_str(&content).unwrap_or(Value::Null),
        auth_group_ids: parse_id_set(
            row.try_get::<Option<String>, _>("auth_group_id")
                .map_err(|e| e.to_string())?
                .as_deref(),
        ),
        token_invalid: row.try_get("token_invalid").map_err(|e| e.to_string())?,
        last_auth_check_at: checked_at.as_deref().map(parse_db_time).transpose()?,
        last_auth_error: row.try_get("last_auth_error").map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth(content: Value) -> Auth {
        Auth {
            id: 1,
            key: "k".to_string(),
            content,
            auth_group_ids: vec![],
            token_invalid: false,
            last_auth_check_at: None,
            last_auth_error: None,
        }
    }

    #[test]
    fn provider_is_normalized() {
        assert_eq!(auth(json!({"type": " Codex "})).provider().as_deref(), Some("codex"));
        assert_eq!(auth(json!({})).provider(), None);
    }

    #[test]
    fn runtime_only_accepts_bool_or_string() {
        assert!(auth(json!({"runtime_only": true})).runtime_only());
        assert!(auth(json!({"runtime_only": "TRUE"})).runtime_only());
        assert!(!auth(json!({"runtime_only": "no"})).runtime_only());
        assert!(!auth(json!({})).runtime_only());
    }

    #[test]
    fn fields_fall_back_to_metadata() {
        let a = auth(json!({"project_id": "", "metadata": {"project_id": "proj-1"}}));
        assert_eq!(a.project_id(), Some("proj-1"));
        let b = auth(json!({"project_id": "top", "metadata": {"project_id": "nested"}}));
        assert_eq!(b.project_id(), Some("top"));
        assert_eq!(b.access_token(), None);
    }
}
