//! Handlers for usage stats and the sync trigger.

use axum::{Json, extract::State};

use crate::{
    AppState,
    api::models::SyncRequest,
    auth::CurrentCustomer,
    billing::{SyncResult, UsageStats},
    errors::Result,
};

/// Get current-period usage for the authenticated customer
#[utoipa::path(
    get,
    path = "/usage/stats",
    tag = "usage",
    summary = "Get current-period usage",
    description = "Spark totals for the authenticated customer, recomputed from the telemetry source for the current calendar month",
    responses(
        (status = 200, description = "Current-period usage totals", body = UsageStats),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Telemetry source unavailable"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn get_usage_stats(
    State(state): State<AppState>,
    customer: CurrentCustomer,
) -> Result<Json<UsageStats>> {
    let stats = state.billing.get_usage_stats(&customer.customer_id).await?;
    Ok(Json(stats))
}

/// Trigger a billing sync pass
#[utoipa::path(
    post,
    path = "/usage/sync",
    tag = "usage",
    summary = "Bill the current period's traces",
    description = "Fetches traces since the start of the month (or just the named one), converts them to sparks and reports meter events. Always returns 200 with a per-trace breakdown; failures are listed, never raised, so scheduled retries stay simple.",
    request_body = SyncRequest,
    responses(
        (status = 200, description = "Per-trace breakdown of the pass", body = SyncResult),
    )
)]
pub async fn sync_usage(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Json<SyncResult> {
    Json(state.billing.sync_usage(request.trace_id).await)
}
