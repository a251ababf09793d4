use crate::db::{db_time, parse_db_time};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    PerRequest,
    PerToken,
}

impl BillingType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "per_request" => Some(Self::PerRequest),
            "per_token" => Some(Self::PerToken),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerRequest => "per_request",
            Self::PerToken => "per_token",
        }
    }
}

/// Token prices are per 1,000,000 tokens; the request price is per request.
#[derive(Debug, Clone, Serialize)]
pub struct BillingRule {
    pub id: i64,
    pub auth_group_id: i64,
    pub user_group_id: i64,
    pub provider: String,
    pub model: String,
    pub billing_type: BillingType,
    pub price_per_request: Option<Decimal>,
    pub price_input_token: Option<Decimal>,
    pub price_output_token: Option<Decimal>,
    pub price_cache_create_token: Option<Decimal>,
    pub price_cache_read_token: Option<Decimal>,
    pub is_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// A pair of group ids a rule can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupScope {
    pub auth_group_id: i64,
    pub user_group_id: i64,
}

impl GroupScope {
    pub fn new(auth_group_id: i64, user_group_id: i64) -> Self {
        Self {
            auth_group_id,
            user_group_id,
        }
    }

    pub fn from_parts(auth_group_id: Option<i64>, user_group_id: Option<i64>) -> Option<Self> {
        Some(Self::new(auth_group_id?, user_group_id?))
    }

    fn matches(&self, rule: &BillingRule) -> bool {
        rule.auth_group_id == self.auth_group_id && rule.user_group_id == self.user_group_id
    }
}

pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

pub fn normalize_model(model: &str) -> String {
    model.trim().to_string()
}

fn rule_tier(
    rule: &BillingRule,
    caller: Option<GroupScope>,
    fallback: Option<GroupScope>,
    provider: &str,
    model: &str,
) -> Option<u8> {
    let rule_provider = normalize_provider(&rule.provider);
    let rule_model = normalize_model(&rule.model);
    let exact = !provider.is_empty()
        && !model.is_empty()
        && rule_provider == provider
        && rule_model == model;
    let generic = rule_provider.is_empty() && rule_model.is_empty();

    let in_caller = caller.is_some_and(|scope| scope.matches(rule));
    let in_default = fallback.is_some_and(|scope| scope.matches(rule));

    if in_caller && exact {
        Some(3)
    } else if in_caller && generic {
        Some(2)
    } else if in_default && exact {
        Some(1)
    } else if in_default && generic {
        Some(0)
    } else {
        None
    }
}

/// Picks the most specific enabled rule: the caller's own groups beat the defaults,
/// an exact provider/model rule beats a group-wide one, and ties go to the most
/// recently updated rule, then the highest id.
pub fn select_billing_rule<'a>(
    rules: &'a [BillingRule],
    caller: Option<GroupScope>,
    fallback: Option<GroupScope>,
    provider: &str,
    model: &str,
) -> Option<&'a BillingRule> {
    let provider = normalize_provider(provider);
    let model = normalize_model(model);

    rules
        .iter()
        .filter(|rule| rule.is_enabled)
        .filter_map(|rule| {
            rule_tier(rule, caller, fallback, &provider, &model).map(|tier| (tier, rule))
        })
        .max_by(|(tier_a, a), (tier_b, b)| {
            tier_a
                .cmp(tier_b)
                .then(a.updated_at.cmp(&b.updated_at))
                .then(a.id.cmp(&b.id))
        })
        .map(|(_, rule)| rule)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBillingRuleInput {
    pub auth_group_id: i64,
    pub user_group_id: i64,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub billing_type: BillingType,
    pub price_per_request: Option<Decimal>,
    pub price_input_token: Option<Decimal>,
    pub price_output_token: Option<Decimal>,
    pub price_cache_create_token: Option<Decimal>,
    pub price_cache_read_token: Option<Decimal>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn validate_rule_input(input: &CreateBillingRuleInput) -> Result<(), String> {
    let token_prices = [
        input.price_input_token,
        input.price_output_token,
        input.price_cache_create_token,
        input.price_cache_read_token,
    ];
    let has_token_price = token_prices.iter().any(Option::is_some);
    match input.billing_type {
        BillingType::PerRequest => {
            if input.price_per_request.is_none() {
                return Err("per_request rule requires price_per_request".to_string());
            }
            if has_token_price {
                return Err("per_request rule must not carry token prices".to_string());
            }
        }
        BillingType::PerToken => {
            if input.price_per_request.is_some() {
                return Err("per_token rule must not carry price_per_request".to_string());
            }
            if !has_token_price {
                return Err("per_token rule requires at least one token price".to_string());
            }
        }
    }
    let negative = token_prices
        .iter()
        .chain(std::iter::once(&input.price_per_request))
        .flatten()
        .any(|p| p.is_sign_negative() && !p.is_zero());
    if negative {
        return Err("prices must be >= 0".to_string());
    }
    Ok(())
}

#[derive(Clone)]
pub struct BillingRuleStore {
    pool: Pool<Sqlite>,
}

impl BillingRuleStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS billing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                auth_group_id INTEGER NOT NULL,
                user_group_id INTEGER NOT NULL,
                provider TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                billing_type TEXT NOT NULL CHECK (billing_type IN ('per_request', 'per_token')),
                price_per_request TEXT,
                price_input_token TEXT,
                price_output_token TEXT,
                price_cache_create_token TEXT,
                price_cache_read_token TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_billing_rules_scope ON billing_rules(auth_group_id, user_group_id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_rule(&self, input: CreateBillingRuleInput) -> Result<BillingRule, String> {
        validate_rule_input(&input)?;
        let now = db_time(Utc::now());
        let result = sqlx::query(
            r#"INSERT INTO billing_rules
               (auth_group_id, user_group_id, provider, model, billing_type, price_per_request,
                price_input_token, price_output_token, price_cache_create_token, price_cache_read_token,
                is_enabled, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(input.auth_group_id)
        .bind(input.user_group_id)
        .bind(normalize_provider(&input.provider))
        .bind(normalize_model(&input.model))
        .bind(input.billing_type.as_str())
        .bind(input.price_per_request.map(|p| p.to_string()))
        .bind(input.price_input_token.map(|p| p.to_string()))
        .bind(input.price_output_token.map(|p| p.to_string()))
        .bind(input.price_cache_create_token.map(|p| p.to_string()))
        .bind(input.price_cache_read_token.map(|p| p.to_string()))
        .bind(input.is_enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let id = result.last_insert_rowid();
        let row = sqlx::query(&format!("{RULE_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row_to_rule(&row)
    }

    /// Overrides `updated_at`, used when rule freshness decides a tie.
    pub async fn touch_rule(&self, id: i64, updated_at: DateTime<Utc>) -> Result<(), String> {
        sqlx::query("UPDATE billing_rules SET updated_at = ? WHERE id = ?")
            .bind(db_time(updated_at))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

const RULE_COLUMNS: &str = r#"SELECT id, auth_group_id, user_group_id, provider, model, billing_type,
       price_per_request, price_input_token, price_output_token, price_cache_create_token,
       price_cache_read_token, is_enabled, updated_at
       FROM billing_rules"#;

/// Enabled rules scoped to any of the given group pairs, loaded with one query.
pub async fn load_rules_for_scopes(
    conn: &mut SqliteConnection,
    scopes: &[GroupScope],
) -> Result<Vec<BillingRule>, String> {
    if scopes.is_empty() {
        return Ok(Vec::new());
    }
    let clauses = vec!["(auth_group_id = ? AND user_group_id = ?)"; scopes.len()].join(" OR ");
    let sql = format!("{RULE_COLUMNS} WHERE is_enabled = 1 AND ({clauses})");
    let mut query = sqlx::query(&sql);
    for scope in scopes {
        query = query.bind(scope.auth_group_id).bind(scope.user_group_id);
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;
    rows.iter().map(row_to_rule).collect()
}

fn parse_price(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<Decimal>, String> {
    let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => Decimal::from_str(v)
            .map(Some)
            .map_err(|e| format!("invalid {column} {v:?}: {e}")),
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<BillingRule, String> {
    let billing_type_raw: String = row.try_get("billing_type").map_err(|e| e.to_string())?;
    let billing_type = BillingType::from_str(&billing_type_raw)
        .ok_or_else(|| format!("invalid billing type: {billing_type_raw}"))?;
    Ok(BillingRule {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        auth_group_id: row.try_get("auth_group_id").map_err(|e| e.to_string())?,
        user_group_id: row.try_get("user_group_id").map_err(|e| e.to_string())?,
        provider: row.try_get("provider").map_err(|e| e.to_string())?,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        billing_type,
        price_per_request: parse_price(row, "price_per_request")?,
        price_input_token: parse_price(row, "price_input_token")?,
        price_output_token: parse_price(row, "price_output_token")?,
        price_cache_create_token: parse_price(row, "price_cache_create_token")?,
        price_cache_read_token: parse_price(row, "price_cache_read_token")?,
        is_enabled: row.try_get("is_enabled").map_err(|e| e.to_string())?,
        updated_at: parse_db_time(
            &row.try_get::<String, _>("updated_at")
                .map_err(|e| e.to_string())?,
        )?,
    })
}
