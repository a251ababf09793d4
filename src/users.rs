use crate::db::{db_time, encode_id_set, parse_id_set};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub user_group_ids: Vec<i64>,
    /// Union of the group sets of every bill currently funding this user.
    pub bill_user_group_ids: Vec<i64>,
}

impl User {
    pub fn primary_user_group_id(&self) -> Option<i64> {
        self.user_group_ids.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingErrorKind {
    InvalidStoredBalance,
    Overflow,
    Internal,
}

#[derive(Debug, Clone)]
pub struct BillingError {
    pub kind: BillingErrorKind,
    pub message: String,
}

impl BillingError {
    pub fn new(kind: BillingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Internal, message)
    }
}

impl std::fmt::Display for BillingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                user_group_id TEXT NOT NULL DEFAULT '[]',
                bill_user_group_id TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_user(&self, username: &str, user_group_ids: &[i64]) -> Result<User, String> {
        let now = db_time(Utc::now());
        let result = sqlx::query(
            "INSERT INTO users (username, user_group_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(encode_id_set(user_group_ids))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_user_by_id(result.last_insert_rowid())
            .await?
            .ok_or_else(|| "user not found after create".to_string())
    }

    pub async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, String> {
        let mut conn = self.pool.acquire().await.map_err(|e| e.to_string())?;
        get_user_tx(&mut *conn, id).await
    }

    pub async fn create_api_key(&self, user_id: i64, key: &str, name: &str) -> Result<i64, String> {
        let result = sqlx::query(
            "INSERT INTO api_keys (user_id, key, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(key)
        .bind(name)
        .bind(db_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.last_insert_rowid())
    }
}

pub async fn get_user_tx(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>, String> {
    let row = sqlx::query(
        "SELECT id, username, user_group_id, bill_user_group_id FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| e.to_string())?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        user_group_ids: parse_id_set(
            row.try_get::<Option<String>, _>("user_group_id")
                .map_err(|e| e.to_string())?
                .as_deref(),
        ),
        bill_user_group_ids: parse_id_set(
            row.try_get::<Option<String>, _>("bill_user_group_id")
                .map_err(|e| e.to_string())?
                .as_deref(),
        ),
    }))
}

pub async fn user_id_for_api_key(
    conn: &mut SqliteConnection,
    api_key_id: i64,
) -> Result<Option<i64>, String> {
    sqlx::query_scalar::<_, i64>("SELECT user_id FROM api_keys WHERE id = ?")
        .bind(api_key_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| e.to_string())
}

pub async fn set_bill_user_group_ids(
    conn: &mut SqliteConnection,
    user_id: i64,
    group_ids: &[i64],
) -> Result<(), String> {
    sqlx::query("UPDATE users SET bill_user_group_id = ?, updated_at = ? WHERE id = ?")
        .bind(encode_id_set(group_ids))
        .bind(db_time(Utc::now()))
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}
