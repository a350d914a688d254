use axum::extract::{Extension, State};
use axum::Json;
use chrono::{DateTime, Datelike, Utc};
use common_http_errors::ApiResult;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::completion_handlers::principal_and_tier;
use crate::context::RequestContext;
use crate::pipeline::identity_error;

#[derive(Serialize)]
pub struct UsageReport {
    pub principal_id: Uuid,
    pub tier: &'static str,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub projected_monthly_cost: f64,
    pub keys: Vec<KeyUsageEntry>,
}

#[derive(Serialize)]
pub struct KeyUsageEntry {
    pub id: Uuid,
    pub name: String,
    pub display: String,
    pub active: bool,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub last_used: Option<DateTime<Utc>>,
}

/// GET /v1/usage — aggregate of the principal's key tallies, with a naive
/// month-end projection from the spend so far.
pub async fn usage_report(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<UsageReport>> {
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    let keys = state
        .identity
        .list_keys(principal.id)
        .await
        .map_err(|err| identity_error(&ctx, err))?;

    let mut requests = 0u64;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut cost = 0f64;
    let entries: Vec<KeyUsageEntry> = keys
        .iter()
        .map(|key| {
            requests += key.usage.requests;
            input_tokens += key.usage.input_tokens;
            output_tokens += key.usage.output_tokens;
            cost += key.usage.cost;
            KeyUsageEntry {
                id: key.id,
                name: key.name.clone(),
                display: key.masked(),
                active: key.active,
                requests: key.usage.requests,
                input_tokens: key.usage.input_tokens,
                output_tokens: key.usage.output_tokens,
                cost: key.usage.cost,
                last_used: key.last_used,
            }
        })
        .collect();

    let day_of_month = Utc::now().day().max(1) as f64;
    let projected_monthly_cost = cost * (30.0 / day_of_month);

    Ok(Json(UsageReport {
        principal_id: principal.id,
        tier: tier.name.as_str(),
        requests,
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
        cost,
        projected_monthly_cost,
        keys: entries,
    }))
}
