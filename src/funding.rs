//! Subscription bills and prepaid cards, and the engine that charges them.
//!
//! Every deduction function runs on the caller's connection inside a transaction
//! opened with [`crate::db::begin_immediate`]. Candidate rows are always read in a
//! fixed order (soonest end, then id), so overlapping deductions touch rows in the
//! same sequence and the outer transaction decides atomically whether anything is
//! written at all.

use crate::db::{db_time, encode_id_set, parse_db_time, parse_id_set};
use crate::users::{BillingError, BillingErrorKind, set_bill_user_group_ids};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::collections::BTreeSet;

pub const BILL_STATUS_PAID: &str = "paid";

pub fn to_micros(amount: f64) -> i64 {
    (amount * 1_000_000.0).round() as i64
}

pub fn from_micros(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct Bill {
    pub id: i64,
    pub user_id: i64,
    pub user_group_ids: Vec<i64>,
    pub left_quota: f64,
    pub used_quota: f64,
    /// `None` means no per-day cap.
    pub daily_quota: Option<f64>,
    pub used_count: i64,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepaidCard {
    pub id: i64,
    pub card_sn: String,
    pub amount: f64,
    pub balance: f64,
    pub user_group_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeemed_user_id: Option<i64>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewBill {
    pub user_id: i64,
    pub user_group_ids: Vec<i64>,
    pub quota: f64,
    pub daily_quota: Option<f64>,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewPrepaidCard {
    pub card_sn: String,
    pub amount: f64,
    pub user_group_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeemed_user_id: Option<i64>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub is_enabled: bool,
}

#[derive(Clone)]
pub struct FundingStore {
    pool: Pool<Sqlite>,
}

impl FundingStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS bills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                user_group_id TEXT NOT NULL DEFAULT '[]',
                left_quota REAL NOT NULL DEFAULT 0,
                used_quota REAL NOT NULL DEFAULT 0,
                daily_quota REAL,
                used_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bills_user_period ON bills(user_id, period_end)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS prepaid_cards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                card_sn TEXT NOT NULL UNIQUE,
                amount REAL NOT NULL DEFAULT 0,
                balance REAL NOT NULL DEFAULT 0,
                user_group_id INTEGER,
                expires_at TEXT,
                redeemed_user_id INTEGER,
                redeemed_at TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_prepaid_cards_redeemed_user ON prepaid_cards(redeemed_user_id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_bill(&self, input: NewBill) -> Result<Bill, String> {
        let now = db_time(Utc::now());
        let result = sqlx::query(
            r#"INSERT INTO bills
               (user_id, user_group_id, left_quota, used_quota, daily_quota, used_count, status,
                period_start, period_end, is_enabled, created_at, updated_at)
               VALUES (?, ?, ?, 0, ?, 0, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(input.user_id)
        .bind(encode_id_set(&input.user_group_ids))
        .bind(input.quota)
        .bind(input.daily_quota)
        .bind(&input.status)
        .bind(db_time(input.period_start))
        .bind(db_time(input.period_end))
        .bind(input.is_enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_bill(result.last_insert_rowid())
            .await?
            .ok_or_else(|| "bill not found after create".to_string())
    }

    pub async fn get_bill(&self, id: i64) -> Result<Option<Bill>, String> {
        let row = sqlx::query(&format!("{BILL_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_bill).transpose()
    }

    pub async fn create_prepaid_card(&self, input: NewPrepaidCard) -> Result<PrepaidCard, String> {
        let now = db_time(Utc::now());
        let result = sqlx::query(
            r#"INSERT INTO prepaid_cards
               (card_sn, amount, balance, user_group_id, expires_at, redeemed_user_id, redeemed_at,
                is_enabled, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&input.card_sn)
        .bind(input.amount)
        .bind(input.amount)
        .bind(input.user_group_id)
        .bind(input.expires_at.map(db_time))
        .bind(input.redeemed_user_id)
        .bind(input.redeemed_at.map(db_time))
        .bind(input.is_enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_prepaid_card(result.last_insert_rowid())
            .await?
            .ok_or_else(|| "prepaid card not found after create".to_string())
    }

    pub async fn get_prepaid_card(&self, id: i64) -> Result<Option<PrepaidCard>, String> {
        let row = sqlx::query(&format!("{CARD_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_card).transpose()
    }
}

const BILL_COLUMNS: &str = r#"SELECT id, user_id, user_group_id, left_quota, used_quota, daily_quota,
       used_count, status, period_start, period_end, is_enabled
       FROM bills"#;

const CARD_COLUMNS: &str = r#"SELECT id, card_sn, amount, balance, user_group_id, expires_at,
       redeemed_user_id, redeemed_at, is_enabled
       FROM prepaid_cards"#;

fn row_to_bill(row: &sqlx::sqlite::SqliteRow) -> Result<Bill, String> {
    let daily_quota: Option<f64> = row.try_get("daily_quota").map_err(|e| e.to_string())?;
    Ok(Bill {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        user_group_ids: parse_id_set(
            row.try_get::<Option<String>, _>("user_group_id")
                .map_err(|e| e.to_string())?
                .as_deref(),
        ),
        left_quota: row.try_get("left_quota").map_err(|e| e.to_string())?,
        used_quota: row.try_get("used_quota").map_err(|e| e.to_string())?,
        daily_quota: daily_quota.filter(|q| q.is_finite() && *q > 0.0),
        used_count: row.try_get("used_count").map_err(|e| e.to_string())?,
        status: row.try_get("status").map_err(|e| e.to_string())?,
        period_start: parse_db_time(
            &row.try_get::<String, _>("period_start")
                .map_err(|e| e.to_string())?,
        )?,
        period_end: parse_db_time(
            &row.try_get::<String, _>("period_end")
                .map_err(|e| e.to_string())?,
        )?,
        is_enabled: row.try_get("is_enabled").map_err(|e| e.to_string())?,
    })
}

fn parse_optional_time(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
    raw.as_deref().map(parse_db_time).transpose()
}

fn row_to_card(row: &sqlx::sqlite::SqliteRow) -> Result<PrepaidCard, String> {
    Ok(PrepaidCard {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        card_sn: row.try_get("card_sn").map_err(|e| e.to_string())?,
        amount: row.try_get("amount").map_err(|e| e.to_string())?,
        balance: row.try_get("balance").map_err(|e| e.to_string())?,
        user_group_id: row.try_get("user_group_id").map_err(|e| e.to_string())?,
        expires_at: parse_optional_time(row, "expires_at")?,
        redeemed_user_id: row.try_get("redeemed_user_id").map_err(|e| e.to_string())?,
        redeemed_at: parse_optional_time(row, "redeemed_at")?,
        is_enabled: row.try_get("is_enabled").map_err(|e| e.to_string())?,
    })
}

/// Start of the current local calendar day, as UTC.
pub fn local_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let local_date = now.with_timezone(&Local).date_naive();
    local_date
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now)
}

async fn lock_active_bills(
    conn: &mut SqliteConnection,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Bill>, BillingError> {
    let now = db_time(now);
    let rows = sqlx::query(&format!(
        r#"{BILL_COLUMNS}
           WHERE user_id = ? AND is_enabled = 1 AND status = ?
             AND period_start <= ? AND period_end > ?
           ORDER BY period_end ASC, period_start ASC, id ASC"#
    ))
    .bind(user_id)
    .bind(BILL_STATUS_PAID)
    .bind(&now)
    .bind(&now)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::internal(e.to_string()))?;

    rows.iter()
        .map(|row| {
            row_to_bill(row).map_err(|e| BillingError::new(BillingErrorKind::InvalidStoredBalance, e))
        })
        .collect()
}

fn checked_sum(mut values: impl Iterator<Item = i64>) -> Result<i64, BillingError> {
    values.try_fold(0i64, |acc, v| {
        acc.checked_add(v)
            .ok_or_else(|| BillingError::new(BillingErrorKind::Overflow, "quota sum overflow"))
    })
}

/// Bill-funded spend of the user since local midnight, in micros.
async fn bill_spend_today(
    conn: &mut SqliteConnection,
    user_id: i64,
    user_group_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<i64, BillingError> {
    let since = db_time(local_day_start(now));
    let mut sql = String::from(
        "SELECT COALESCE(SUM(cost_micros), 0) FROM usages \
         WHERE user_id = ? AND charged_to = 'bill' AND requested_at >= ?",
    );
    if user_group_id.is_some() {
        sql.push_str(" AND user_group_id = ?");
    }
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(user_id).bind(since);
    if let Some(group) = user_group_id {
        query = query.bind(group);
    }
    query
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| BillingError::internal(e.to_string()))
}

/// Charges `amount_micros` against the user's active paid bills.
///
/// Returns `Ok(false)` without writing anything when the bills cannot cover the whole
/// amount or the aggregate daily cap is already used up.
pub async fn deduct_from_bills(
    conn: &mut SqliteConnection,
    user_id: i64,
    user_group_id: Option<i64>,
    amount_micros: i64,
    now: DateTime<Utc>,
) -> Result<bool, BillingError> {
    if amount_micros <= 0 {
        return Ok(false);
    }
    let bills: Vec<Bill> = lock_active_bills(conn, user_id, now)
        .await?
        .into_iter()
        .filter(|bill| user_group_id.is_none_or(|group| bill.user_group_ids.contains(&group)))
        .collect();
    if bills.is_empty() {
        return Ok(false);
    }

    let available = checked_sum(bills.iter().map(|b| to_micros(b.left_quota).max(0)))?;
    if available < amount_micros {
        tracing::debug!(user_id, available, amount_micros, "bills cannot cover charge");
        return Ok(false);
    }

    if bills.iter().all(|b| b.daily_quota.is_some()) {
        let daily_cap = checked_sum(bills.iter().filter_map(|b| b.daily_quota).map(to_micros))?;
        let spent_today = bill_spend_today(conn, user_id, user_group_id, now).await?;
        if spent_today >= daily_cap {
            tracing::debug!(user_id, spent_today, daily_cap, "bill daily quota exhausted");
            return Ok(false);
        }
    }

    let updated_at = db_time(now);
    let mut remaining = amount_micros;
    for bill in &bills {
        if remaining == 0 {
            break;
        }
        let left = to_micros(bill.left_quota);
        if left <= 0 {
            continue;
        }
        let take = left.min(remaining);
        let used = to_micros(bill.used_quota)
            .checked_add(take)
            .ok_or_else(|| BillingError::new(BillingErrorKind::Overflow, "used quota overflow"))?;
        sqlx::query(
            "UPDATE bills SET left_quota = ?, used_quota = ?, used_count = used_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(from_micros(left - take))
        .bind(from_micros(used))
        .bind(&updated_at)
        .bind(bill.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| BillingError::internal(e.to_string()))?;
        remaining -= take;
    }

    refresh_bill_user_groups(conn, user_id, now)
        .await
        .map_err(BillingError::internal)?;
    Ok(true)
}

/// Recomputes the user's denormalized `bill_user_group_id`: the union of the group
/// sets of every bill that can still fund requests.
pub async fn refresh_bill_user_groups(
    conn: &mut SqliteConnection,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, String> {
    let now = db_time(now);
    let rows: Vec<Option<String>> = sqlx::query_scalar(
        r#"SELECT user_group_id FROM bills
           WHERE user_id = ? AND is_enabled = 1 AND status = ?
             AND period_start <= ? AND period_end > ? AND left_quota > 0"#,
    )
    .bind(user_id)
    .bind(BILL_STATUS_PAID)
    .bind(&now)
    .bind(&now)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| e.to_string())?;

    let merged: BTreeSet<i64> = rows
        .iter()
        .flat_map(|raw| parse_id_set(raw.as_deref()))
        .collect();
    let merged: Vec<i64> = merged.into_iter().collect();
    set_bill_user_group_ids(conn, user_id, &merged).await?;
    Ok(merged)
}

async fn lock_usable_cards(
    conn: &mut SqliteConnection,
    user_id: i64,
    user_group_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<PrepaidCard>, BillingError> {
    let group_clause = if user_group_id.is_some() {
        " AND user_group_id = ?"
    } else {
        ""
    };
    let sql = format!(
        r#"{CARD_COLUMNS}
           WHERE redeemed_user_id = ? AND redeemed_at IS NOT NULL AND is_enabled = 1
             AND balance > 0 AND (expires_at IS NULL OR expires_at > ?){group_clause}
           ORDER BY expires_at IS NULL ASC, expires_at ASC, redeemed_at ASC, id ASC"#
    );
    let mut query = sqlx::query(&sql).bind(user_id).bind(db_time(now));
    if let Some(group) = user_group_id {
        query = query.bind(group);
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| BillingError::internal(e.to_string()))?;
    rows.iter()
        .map(|row| {
            row_to_card(row).map_err(|e| BillingError::new(BillingErrorKind::InvalidStoredBalance, e))
        })
        .collect()
}

/// Charges `amount_micros` against the user's redeemed, unexpired prepaid cards,
/// soonest-expiring first. All or nothing, like the bill path.
pub async fn deduct_from_prepaid(
    conn: &mut SqliteConnection,
    user_id: i64,
    user_group_id: Option<i64>,
    amount_micros: i64,
    now: DateTime<Utc>,
) -> Result<bool, BillingError> {
    if amount_micros <= 0 {
        return Ok(false);
    }
    let cards = lock_usable_cards(conn, user_id, user_group_id, now).await?;
    let available = checked_sum(cards.iter().map(|c| to_micros(c.balance).max(0)))?;
    if available < amount_micros {
        tracing::debug!(user_id, available, amount_micros, "prepaid cards cannot cover charge");
        return Ok(false);
    }

    let updated_at = db_time(now);
    let mut remaining = amount_micros;
    for card in &cards {
        if remaining == 0 {
            break;
        }
        let balance = to_micros(card.balance);
        if balance <= 0 {
            continue;
        }
        let take = balance.min(remaining);
        sqlx::query("UPDATE prepaid_cards SET balance = ?, updated_at = ? WHERE id = ?")
            .bind(from_micros(balance - take))
            .bind(&updated_at)
            .bind(card.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| BillingError::internal(e.to_string()))?;
        remaining -= take;
    }
    Ok(true)
}
