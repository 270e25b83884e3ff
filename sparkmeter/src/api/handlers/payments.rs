//! Handlers for payment methods, invoices, portal sessions and provider
//! webhooks.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use tracing::info;

use crate::{
    AppState,
    api::models::{AttachPaymentMethodRequest, PortalSessionRequest, PortalSessionResponse},
    auth::CurrentCustomer,
    errors::Result,
    payment_providers::UpcomingInvoice,
};

/// Attach a payment method as the customer's default
#[utoipa::path(
    post,
    path = "/payment-methods",
    tag = "payments",
    summary = "Attach a payment method",
    description = "Attaches a provider payment method to the customer and makes it the default for invoices",
    request_body = AttachPaymentMethodRequest,
    responses(
        (status = 204, description = "Payment method attached"),
        (status = 400, description = "Invalid payment method"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn attach_payment_method(
    State(state): State<AppState>,
    customer: CurrentCustomer,
    Json(request): Json<AttachPaymentMethodRequest>,
) -> Result<StatusCode> {
    state
        .billing
        .attach_payment_method(&customer.customer_id, &request.payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Preview the customer's next invoice
#[utoipa::path(
    post,
    path = "/invoices/upcoming",
    tag = "payments",
    summary = "Preview the upcoming invoice",
    responses(
        (status = 200, description = "Upcoming invoice preview", body = UpcomingInvoice),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Customer has no upcoming invoice"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn get_upcoming_invoice(
    State(state): State<AppState>,
    customer: CurrentCustomer,
) -> Result<Json<UpcomingInvoice>> {
    let invoice = state.billing.get_upcoming_invoice(&customer.customer_id).await?;
    Ok(Json(invoice))
}

/// Create a hosted billing portal session
#[utoipa::path(
    post,
    path = "/portal-sessions",
    tag = "payments",
    summary = "Create a billing portal session",
    description = "Creates a provider-hosted portal session where the customer manages payment details and invoices",
    request_body = PortalSessionRequest,
    responses(
        (status = 201, description = "Portal session created", body = PortalSessionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Payment provider error"),
    ),
    security(
        ("x-customer-id" = [])
    )
)]
pub async fn create_portal_session(
    State(state): State<AppState>,
    customer: CurrentCustomer,
    Json(request): Json<PortalSessionRequest>,
) -> Result<(StatusCode, Json<PortalSessionResponse>)> {
    let portal_url = state
        .billing
        .create_billing_portal_session(&customer.customer_id, &request.return_url)
        .await?;
    Ok((StatusCode::CREATED, Json(PortalSessionResponse { portal_url })))
}

/// Payment provider webhook receiver.
///
/// Authenticated by signature verification against the raw body, not by the
/// customer header, so it sits outside the documented client API. Unverified
/// payloads are rejected before any event handling runs.
pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode> {
    let Some(event) = state.billing.validate_webhook(&headers, &body).await? else {
        return Ok(StatusCode::OK);
    };

    info!(event_type = %event.event_type, "processing payment webhook");
    state.billing.process_webhook_event(&event).await?;
    Ok(StatusCode::OK)
}
