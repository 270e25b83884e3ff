//! Payment provider abstraction layer
//!
//! This module defines the `PaymentProvider` trait which abstracts the billing
//! ledger and subscription operations across providers (Stripe, or an
//! in-memory dummy for development). The meter-event path is the one the sync
//! loop leans on; everything else is customer self-service plumbing.

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{config::PaymentConfig, types::CustomerId};

pub mod dummy;
pub mod stripe;

/// Create a payment provider from configuration
///
/// This is the single point where we convert config into provider instances.
/// Adding a new provider requires adding a match arm here.
pub fn create_provider(config: PaymentConfig) -> Box<dyn PaymentProvider> {
    match config {
        PaymentConfig::Stripe(stripe_config) => Box::new(stripe::StripeProvider::from(stripe_config)),
        PaymentConfig::Dummy(dummy_config) => Box::new(dummy::DummyProvider::from(dummy_config)),
    }
}

/// Result type for payment provider operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur while talking to the billing ledger
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Customer {0} has no active subscription")]
    NoSubscription(CustomerId),

    #[error("Customer {0} not recognized by the payment provider")]
    UnknownCustomer(CustomerId),
}

impl From<&PaymentError> for StatusCode {
    fn from(err: &PaymentError) -> Self {
        match err {
            PaymentError::InvalidData(_) => StatusCode::BAD_REQUEST,
            PaymentError::NoSubscription(_) | PaymentError::UnknownCustomer(_) => StatusCode::NOT_FOUND,
            PaymentError::ProviderApi(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// One usage quantity reported against a billing meter.
///
/// The idempotency key is derived from the trace id (`usage-{trace_id}`), so
/// re-syncing a window never double-bills: the provider is expected to treat
/// a repeated key as already recorded, not as a new event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterEvent {
    pub customer_id: CustomerId,
    /// Provider-side meter name the value is reported against.
    pub meter: String,
    pub value: u64,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Provider acknowledgement for a submitted meter event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MeterEventConfirmation {
    /// True when the provider had already recorded this idempotency key and
    /// treated the submission as a no-op.
    pub already_recorded: bool,
}

/// A customer's subscription as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Subscription {
    pub id: String,
    pub customer_id: CustomerId,
    /// Provider-side status string ("active", "canceled", ...).
    pub status: String,
    /// Price the subscription is on.
    pub price_id: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// The not-yet-issued invoice for the current billing period.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpcomingInvoice {
    /// Amount due so far, in the smallest currency unit (cents).
    pub amount_due: i64,
    pub currency: String,
    pub period_end: Option<DateTime<Utc>>,
    /// Human-readable line descriptions.
    pub lines: Vec<String>,
}

/// Represents a webhook event from a payment provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Type of event (e.g., "customer.subscription.updated")
    pub event_type: String,
    /// Customer the event concerns, if the payload named one
    pub customer_id: Option<CustomerId>,
}

/// Abstract payment provider interface
///
/// Implementors provide billing-ledger and subscription capabilities for
/// different providers (Stripe, a dummy in-memory ledger, etc.)
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Submit one meter event to the billing ledger.
    ///
    /// Must be idempotent on `event.idempotency_key`: submitting the same key
    /// twice records the usage once and reports `already_recorded` on the
    /// repeat.
    async fn submit_meter_event(&self, event: &MeterEvent) -> Result<MeterEventConfirmation>;

    /// Fetch the customer's current subscription, if any.
    async fn get_subscription(&self, customer_id: &str) -> Result<Option<Subscription>>;

    /// Create a checkout session that puts the customer on `price_id`.
    ///
    /// Returns a URL the customer should be redirected to.
    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        cancel_url: &str,
        success_url: &str,
    ) -> Result<String>;

    /// Move an existing subscription to a different price.
    async fn update_subscription(&self, customer_id: &str, price_id: &str) -> Result<Subscription>;

    /// Cancel the customer's subscription at the end of the current period.
    async fn cancel_subscription(&self, customer_id: &str) -> Result<Subscription>;

    /// Fetch the upcoming (not yet issued) invoice for the customer.
    async fn get_upcoming_invoice(&self, customer_id: &str) -> Result<UpcomingInvoice>;

    /// Attach a payment method to the customer and make it the default.
    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()>;

    /// Create a billing portal session for customer self-service
    ///
    /// Returns a URL that the customer should be redirected to for managing
    /// their billing.
    async fn create_billing_portal_session(&self, customer_id: &str, return_url: &str) -> Result<String>;

    /// Validate and extract webhook event from raw request data
    ///
    /// Returns None if this provider doesn't support webhooks.
    /// Returns Err if validation fails (invalid signature, malformed data, etc.)
    async fn validate_webhook(&self, headers: &axum::http::HeaderMap, body: &str) -> Result<Option<WebhookEvent>>;

    /// Process a validated webhook event
    ///
    /// This is called after validate_webhook succeeds.
    /// Should be idempotent - processing the same event multiple times should
    /// be safe.
    async fn process_webhook_event(&self, event: &WebhookEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_maps_to_status_code() {
        assert_eq!(
            StatusCode::from(&PaymentError::InvalidData("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StatusCode::from(&PaymentError::NoSubscription("cus_1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StatusCode::from(&PaymentError::ProviderApi("down".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn meter_event_serializes_with_snake_case_fields() {
        let event = MeterEvent {
            customer_id: "cus_1".into(),
            meter: "ai_sparks".into(),
            value: 42,
            idempotency_key: "usage-tr-1".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["customer_id"], "cus_1");
        assert_eq!(json["value"], 42);
        assert_eq!(json["idempotency_key"], "usage-tr-1");
    }
}
