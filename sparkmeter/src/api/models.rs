//! Request and response bodies for the HTTP API.
//!
//! Core domain types ([`crate::billing::SyncResult`],
//! [`crate::billing::UsageStats`], [`crate::payment_providers::Subscription`])
//! are serialized directly; this module only holds the thin request wrappers
//! and the session-URL responses.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body for `POST /usage/sync`.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct SyncRequest {
    /// Bill only this trace instead of the whole current period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Body for `POST /subscriptions`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSubscriptionRequest {
    /// Provider price id the subscription is created against.
    pub price_id: String,
    /// Where the provider sends the customer on abandoned checkout.
    pub cancel_url: String,
    /// Where the provider sends the customer after successful checkout.
    pub success_url: String,
}

/// Body for `PUT /subscriptions/{id}`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateSubscriptionRequest {
    /// Price id to move the subscription to.
    pub price_id: String,
}

/// Body for `POST /payment-methods`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AttachPaymentMethodRequest {
    /// Provider payment-method id to attach as the default.
    pub payment_method_id: String,
}

/// Body for `POST /portal-sessions`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PortalSessionRequest {
    /// Where the provider sends the customer when they leave the portal.
    pub return_url: String,
}

/// Hosted checkout session created for a new subscription.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSessionResponse {
    pub checkout_url: String,
}

/// Hosted billing portal session.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PortalSessionResponse {
    pub portal_url: String,
}
