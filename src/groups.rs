use crate::db::db_time;
use chrono::Utc;
use sqlx::{Pool, Sqlite, SqliteConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Auth,
    User,
}

impl GroupKind {
    fn table(&self) -> &'static str {
        match self {
            Self::Auth => "auth_groups",
            Self::User => "user_groups",
        }
    }
}

/// Auth groups (credential pools) and user groups (customer tiers).
#[derive(Clone)]
pub struct GroupStore {
    pool: Pool<Sqlite>,
}

impl GroupStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        for kind in [GroupKind::Auth, GroupKind::User] {
            sqlx::query(&format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    is_default INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )"#,
                kind.table()
            ))
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;
        }
        Ok(Self { pool })
    }

    pub async fn create_group(
        &self,
        kind: GroupKind,
        name: &str,
        is_default: bool,
    ) -> Result<i64, String> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (name, is_default, created_at) VALUES (?, ?, ?)",
            kind.table()
        ))
        .bind(name)
        .bind(is_default)
        .bind(db_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.last_insert_rowid())
    }
}

/// The group flagged `is_default`, else the lowest id, else none.
pub async fn default_group_id(
    conn: &mut SqliteConnection,
    kind: GroupKind,
) -> Result<Option<i64>, String> {
    sqlx::query_scalar::<_, i64>(&format!(
        "SELECT id FROM {} ORDER BY is_default DESC, id ASC LIMIT 1",
        kind.table()
    ))
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| e.to_string())
}
