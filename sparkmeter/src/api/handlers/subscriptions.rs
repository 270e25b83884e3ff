//! Handlers for subscription lifecycle management.
//!
//! Mutating routes address the subscription by id; the id is checked
//! against the authenticated customer's subscription so one customer
//! cannot modify another's.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{CheckoutSessionResponse, CreateSubscriptionRequest, UpdateSubscriptionRequest},
    auth::CurrentCustomer,
    billing::SubscriptionWithUsage,
    errors::{Error, Result},
    payment_providers::Subscription,
};

/// Confirm the path id names the customer's own subscription.
async fn owned_subscription(
    state: &AppState,
    customer: &CurrentCustomer,
    subscription_id: &str,
) -> Result<()> {
    let subscription = state
        .billing
        .get_subscription_with_usage(&customer.customer_id)
        .await?
        .subscription;
    match subscription {
        Some(sub) if sub.id == subscription_id => Ok(()),
        _ => Err(Error::NotFound {
            resource: "Subscription".to_string(),
            id: subscription_id.to_string(),
        }),
    }
}

/// Get the customer's subscription and current-period usage
#[utoipa::path(
    get,
    path = "/subscriptions/current",
    tag = "subscriptions",
    summary = "Get current subscription with usage",
    description = "The authenticated customer's subscription (if any) together with what it has consumed this period",
    responses(
        (status = 200, description = "Subscription and usage", body = SubscriptionWithUsage),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn get_current_subscription(
    State(state): State<AppState>,
    customer: CurrentCustomer,
) -> Result<Json<SubscriptionWithUsage>> {
    let with_usage = state
        .billing
        .get_subscription_with_usage(&customer.customer_id)
        .await?;
    Ok(Json(with_usage))
}

/// Start a checkout session for a new subscription
#[utoipa::path(
    post,
    path = "/subscriptions",
    tag = "subscriptions",
    summary = "Create a subscription",
    description = "Creates a hosted checkout session for the given price; the subscription exists once the customer completes checkout",
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 201, description = "Checkout session created", body = CheckoutSessionResponse),
        (status = 400, description = "Invalid price or request data"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn create_subscription(
    State(state): State<AppState>,
    customer: CurrentCustomer,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<CheckoutSessionResponse>)> {
    let checkout_url = state
        .billing
        .create_checkout_session(
            &customer.customer_id,
            &request.price_id,
            &request.cancel_url,
            &request.success_url,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(CheckoutSessionResponse { checkout_url })))
}

/// Move a subscription to a different price
#[utoipa::path(
    put,
    path = "/subscriptions/{id}",
    tag = "subscriptions",
    summary = "Update a subscription",
    params(
        ("id" = String, Path, description = "Subscription ID"),
    ),
    request_body = UpdateSubscriptionRequest,
    responses(
        (status = 200, description = "Updated subscription", body = Subscription),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Subscription not found for this customer"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn update_subscription(
    State(state): State<AppState>,
    customer: CurrentCustomer,
    Path(subscription_id): Path<String>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> Result<Json<Subscription>> {
    owned_subscription(&state, &customer, &subscription_id).await?;
    let subscription = state
        .billing
        .update_subscription(&customer.customer_id, &request.price_id)
        .await?;
    Ok(Json(subscription))
}

/// Cancel a subscription at period end
#[utoipa::path(
    delete,
    path = "/subscriptions/{id}",
    tag = "subscriptions",
    summary = "Cancel a subscription",
    description = "Marks the subscription to cancel at the end of the current period; access continues until then",
    params(
        ("id" = String, Path, description = "Subscription ID"),
    ),
    responses(
        (status = 200, description = "Subscription marked for cancellation", body = Subscription),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Subscription not found for this customer"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn cancel_subscription(
    State(state): State<AppState>,
    customer: CurrentCustomer,
    Path(subscription_id): Path<String>,
) -> Result<Json<Subscription>> {
    owned_subscription(&state, &customer, &subscription_id).await?;
    let subscription = state.billing.cancel_subscription(&customer.customer_id).await?;
    Ok(Json(subscription))
}
