//! Dummy payment provider implementation
//!
//! Keeps the billing ledger in process memory instead of calling out to a
//! real provider. Useful for development and for exercising the sync path in
//! tests: idempotency behaves like the real thing (repeat keys are reported
//! as already recorded), and specific customers can be configured to fail so
//! per-record error isolation can be observed.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::{
    config::DummyConfig,
    payment_providers::{
        MeterEvent, MeterEventConfirmation, PaymentError, PaymentProvider, Result, Subscription,
        UpcomingInvoice, WebhookEvent,
    },
    types::CustomerId,
};

/// In-memory fake of the billing ledger.
pub struct DummyProvider {
    /// Recorded meter events, keyed by idempotency key.
    ledger: DashMap<String, MeterEvent>,
    /// Subscriptions by customer id.
    subscriptions: DashMap<CustomerId, Subscription>,
    /// Customers whose ledger submissions are rejected, for failure testing.
    fail_customers: Vec<CustomerId>,
}

impl From<DummyConfig> for DummyProvider {
    fn from(config: DummyConfig) -> Self {
        Self {
            ledger: DashMap::new(),
            subscriptions: DashMap::new(),
            fail_customers: config.fail_customers,
        }
    }
}

impl DummyProvider {
    /// Number of distinct meter events recorded so far.
    pub fn distinct_events(&self) -> usize {
        self.ledger.len()
    }

    fn subscription_for(&self, customer_id: &str, price_id: &str) -> Subscription {
        Subscription {
            id: format!("dummy_sub_{customer_id}"),
            customer_id: customer_id.to_string(),
            status: "active".to_string(),
            price_id: price_id.to_string(),
            cancel_at_period_end: false,
            current_period_end: None,
        }
    }
}

#[async_trait]
impl PaymentProvider for DummyProvider {
    async fn submit_meter_event(&self, event: &MeterEvent) -> Result<MeterEventConfirmation> {
        if self.fail_customers.contains(&event.customer_id) {
            return Err(PaymentError::ProviderApi(format!(
                "simulated ledger failure for customer {}",
                event.customer_id
            )));
        }

        if self.ledger.contains_key(&event.idempotency_key) {
            tracing::trace!(
                key = %event.idempotency_key,
                "meter event already recorded, skipping (idempotent)"
            );
            return Ok(MeterEventConfirmation { already_recorded: true });
        }

        self.ledger.insert(event.idempotency_key.clone(), event.clone());
        tracing::debug!(
            customer_id = %event.customer_id,
            meter = %event.meter,
            value = event.value,
            "recorded meter event"
        );
        Ok(MeterEventConfirmation { already_recorded: false })
    }

    async fn get_subscription(&self, customer_id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(customer_id).map(|s| s.clone()))
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        _cancel_url: &str,
        success_url: &str,
    ) -> Result<String> {
        // The dummy provider completes checkout instantly: the subscription
        // exists as soon as the session is created.
        let session_id = format!("dummy_session_{}_{}", customer_id, uuid::Uuid::new_v4());
        self.subscriptions
            .insert(customer_id.to_string(), self.subscription_for(customer_id, price_id));

        tracing::info!("Dummy provider created checkout session {session_id} for customer {customer_id}");
        Ok(success_url.replace("{CHECKOUT_SESSION_ID}", &session_id))
    }

    async fn update_subscription(&self, customer_id: &str, price_id: &str) -> Result<Subscription> {
        let mut entry = self
            .subscriptions
            .get_mut(customer_id)
            .ok_or_else(|| PaymentError::NoSubscription(customer_id.to_string()))?;
        entry.price_id = price_id.to_string();
        entry.cancel_at_period_end = false;
        Ok(entry.clone())
    }

    async fn cancel_subscription(&self, customer_id: &str) -> Result<Subscription> {
        let mut entry = self
            .subscriptions
            .get_mut(customer_id)
            .ok_or_else(|| PaymentError::NoSubscription(customer_id.to_string()))?;
        entry.cancel_at_period_end = true;
        Ok(entry.clone())
    }

    async fn get_upcoming_invoice(&self, customer_id: &str) -> Result<UpcomingInvoice> {
        if !self.subscriptions.contains_key(customer_id) {
            return Err(PaymentError::NoSubscription(customer_id.to_string()));
        }

        // One cent per spark keeps the dummy invoice legible in dev.
        let total: u64 = self
            .ledger
            .iter()
            .filter(|entry| entry.customer_id == customer_id)
            .map(|entry| entry.value)
            .sum();

        Ok(UpcomingInvoice {
            amount_due: total as i64,
            currency: "usd".to_string(),
            period_end: None,
            lines: vec![format!("{total} metered units")],
        })
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()> {
        tracing::info!("Dummy provider attached payment method {payment_method_id} for customer {customer_id}");
        Ok(())
    }

    async fn create_billing_portal_session(&self, customer_id: &str, return_url: &str) -> Result<String> {
        tracing::info!("Dummy provider created billing portal session for customer {customer_id}");
        Ok(return_url.to_string())
    }

    async fn validate_webhook(&self, _headers: &axum::http::HeaderMap, _body: &str) -> Result<Option<WebhookEvent>> {
        // Dummy provider doesn't use webhooks
        Ok(None)
    }

    async fn process_webhook_event(&self, _event: &WebhookEvent) -> Result<()> {
        // Dummy provider doesn't use webhooks
        Ok(())
    }
}
