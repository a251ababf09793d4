use crate::billing_rules::{
    BillingRule, BillingType, GroupScope, load_rules_for_scopes, select_billing_rule,
};
use crate::groups::{GroupKind, default_group_id};
use crate::users::{get_user_tx, user_id_for_api_key};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

const MICROS_PER_UNIT: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    /// Subset of `input_tokens` served from the provider's prompt cache.
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CostInput {
    pub provider: String,
    pub model: String,
    pub tokens: TokenCounts,
    pub failed: bool,
    pub auth_id: Option<i64>,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    /// Billing group chosen explicitly for this request.
    pub billing_user_group_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostOutcome {
    pub cost_micros: i64,
    pub rule_id: Option<i64>,
    pub auth_group_id: Option<i64>,
    pub user_group_id: Option<i64>,
}

/// Applies a rule to the token counts of one request. Returns `None` on arithmetic overflow.
pub fn rule_cost_micros(rule: &BillingRule, tokens: &TokenCounts, failed: bool) -> Option<i64> {
    if failed {
        return Some(0);
    }
    let total = match rule.billing_type {
        BillingType::PerRequest => rule
            .price_per_request
            .unwrap_or_default()
            .checked_mul(Decimal::from(MICROS_PER_UNIT))?,
        BillingType::PerToken => {
            // cached tokens are already counted inside input_tokens by several providers
            let billable_input = (tokens.input_tokens - tokens.cached_tokens).max(0);
            // the cache-create price has no token count to apply to
            let parts = [
                (billable_input, rule.price_input_token),
                (tokens.output_tokens.max(0), rule.price_output_token),
                (tokens.cached_tokens.max(0), rule.price_cache_read_token),
            ];
            let mut sum = Decimal::ZERO;
            for (count, price) in parts {
                let Some(price) = price else {
                    continue;
                };
                sum = sum.checked_add(Decimal::from(count).checked_mul(price)?)?;
            }
            sum
        }
    };
    total
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .map(|v| v.max(0))
}

async fn resolve_auth_group(
    conn: &mut SqliteConnection,
    auth_id: Option<i64>,
) -> Result<Option<i64>, String> {
    let Some(auth_id) = auth_id else {
        return Ok(None);
    };
    let raw = sqlx::query_scalar::<_, Option<String>>("SELECT auth_group_id FROM auths WHERE id = ?")
        .bind(auth_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| e.to_string())?
        .flatten();
    Ok(crate::db::parse_id_set(raw.as_deref()).first().copied())
}

async fn resolve_user_group(
    conn: &mut SqliteConnection,
    input: &CostInput,
) -> Result<Option<i64>, String> {
    if let Some(group) = input.billing_user_group_id {
        return Ok(Some(group));
    }
    if let Some(api_key_id) = input.api_key_id {
        if let Some(owner) = user_id_for_api_key(conn, api_key_id).await? {
            if let Some(group) = get_user_tx(conn, owner)
                .await?
                .and_then(|u| u.primary_user_group_id())
            {
                return Ok(Some(group));
            }
        }
    }
    if let Some(user_id) = input.user_id {
        return Ok(get_user_tx(conn, user_id)
            .await?
            .and_then(|u| u.primary_user_group_id()));
    }
    Ok(None)
}

/// Resolves the groups of a request, finds its billing rule and prices it.
///
/// Lookup failures never abort billing: they are logged and the request costs nothing.
pub async fn calculate_cost(conn: &mut SqliteConnection, input: &CostInput) -> CostOutcome {
    let auth_group_id = resolve_auth_group(conn, input.auth_id)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(auth_id = ?input.auth_id, "auth group lookup failed: {err}");
            None
        });
    let user_group_id = resolve_user_group(conn, input).await.unwrap_or_else(|err| {
        tracing::warn!(user_id = ?input.user_id, "user group lookup failed: {err}");
        None
    });
    let mut outcome = CostOutcome {
        cost_micros: 0,
        rule_id: None,
        auth_group_id,
        user_group_id,
    };

    if input.failed || input.provider.trim().is_empty() || input.model.trim().is_empty() {
        return outcome;
    }

    let rule = match find_rule(conn, input, auth_group_id, user_group_id).await {
        Ok(Some(rule)) => rule,
        Ok(None) => {
            tracing::debug!(
                provider = %input.provider,
                model = %input.model,
                ?auth_group_id,
                ?user_group_id,
                "no billing rule matched"
            );
            return outcome;
        }
        Err(err) => {
            tracing::warn!(
                provider = %input.provider,
                model = %input.model,
                "billing rule lookup failed: {err}"
            );
            return outcome;
        }
    };

    match rule_cost_micros(&rule, &input.tokens, input.failed) {
        Some(cost) => {
            outcome.cost_micros = cost;
            outcome.rule_id = Some(rule.id);
        }
        None => {
            tracing::warn!(rule_id = rule.id, model = %input.model, "billing skipped: cost overflow");
        }
    }
    outcome
}

async fn find_rule(
    conn: &mut SqliteConnection,
    input: &CostInput,
    auth_group_id: Option<i64>,
    user_group_id: Option<i64>,
) -> Result<Option<BillingRule>, String> {
    let caller = GroupScope::from_parts(auth_group_id, user_group_id);
    if let Some(scope) = caller {
        let rules = load_rules_for_scopes(conn, &[scope]).await?;
        if let Some(rule) = select_billing_rule(&rules, caller, None, &input.provider, &input.model)
        {
            return Ok(Some(rule.clone()));
        }
    }

    let Some(fallback) = GroupScope::from_parts(
        default_group_id(conn, GroupKind::Auth).await?,
        default_group_id(conn, GroupKind::User).await?,
    ) else {
        return Ok(None);
    };
    let mut scopes: Vec<GroupScope> = caller.into_iter().collect();
    if Some(fallback) != caller {
        scopes.push(fallback);
    }
    let rules = load_rules_for_scopes(conn, &scopes).await?;
    Ok(select_billing_rule(&rules, caller, Some(fallback), &input.provider, &input.model).cloned())
}
