//! Stripe payment provider implementation
//!
//! Talks to the Stripe REST API directly with `reqwest`. The billing ledger
//! maps onto Stripe billing meter events: each usage record becomes one
//! `POST /v1/billing/meter_events` with the trace-derived idempotency key, so
//! replayed syncs collapse into the original event on Stripe's side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{
    config::StripeConfig,
    payment_providers::{
        MeterEvent, MeterEventConfirmation, PaymentError, PaymentProvider, Result, Subscription,
        UpcomingInvoice, WebhookEvent,
    },
};

/// Stripe payment provider
pub struct StripeProvider {
    client: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    /// API origin, overridable so tests can point at a mock server.
    api_base: String,
}

impl From<StripeConfig> for StripeProvider {
    fn from(config: StripeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: config.secret_key,
            webhook_secret: config.webhook_secret,
            api_base: config.api_base,
        }
    }
}

// Stripe wire shapes, trimmed to the fields we read.

#[derive(Debug, Deserialize)]
struct StripePrice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionItem {
    id: String,
    price: StripePrice,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    customer: String,
    status: String,
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
    items: StripeList<StripeSubscriptionItem>,
}

impl StripeSubscription {
    fn into_subscription(self) -> Result<Subscription> {
        let price_id = self
            .items
            .data
            .first()
            .map(|item| item.price.id.clone())
            .ok_or_else(|| PaymentError::InvalidData("subscription has no items".to_string()))?;
        Ok(Subscription {
            id: self.id,
            customer_id: self.customer,
            status: self.status,
            price_id,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_end: self.current_period_end.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceLine {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    amount_due: i64,
    currency: String,
    period_end: Option<i64>,
    lines: StripeList<StripeInvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
}

impl StripeProvider {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response, context: &str) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::ProviderApi(format!("{context}: failed to read response: {e}")))?;

        if !status.is_success() {
            tracing::error!("Stripe API error ({context}): {status} {body}");
            return Err(PaymentError::ProviderApi(format!("{context}: {status}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| PaymentError::ProviderApi(format!("{context}: unexpected response shape: {e}")))
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
        context: &str,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::ProviderApi(format!("{context}: {e}")))?;
        Self::decode(response, context).await
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> Result<T> {
        let response = self
            .client
            .get(self.endpoint(path))
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| PaymentError::ProviderApi(format!("{context}: {e}")))?;
        Self::decode(response, context).await
    }

    async fn fetch_stripe_subscription(&self, customer_id: &str) -> Result<Option<StripeSubscription>> {
        let list: StripeList<StripeSubscription> = self
            .get(
                "/v1/subscriptions",
                &[("customer", customer_id), ("limit", "1")],
                "list subscriptions",
            )
            .await?;
        Ok(list.data.into_iter().next())
    }

    /// Check the signature on a raw webhook payload.
    ///
    /// Stripe signs `"{timestamp}.{body}"` with HMAC-SHA256 under the
    /// endpoint's webhook secret and sends `t=<ts>,v1=<hex>` in the
    /// `stripe-signature` header.
    fn verify_signature(&self, signature_header: &str, body: &str) -> Result<()> {
        let mut timestamp = None;
        let mut signature = None;
        for part in signature_header.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(v)) => (t, v),
            _ => {
                return Err(PaymentError::InvalidData(
                    "malformed stripe-signature header".to_string(),
                ));
            }
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| PaymentError::InvalidData(format!("invalid webhook secret: {e}")))?;
        mac.update(format!("{timestamp}.{body}").as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if expected != signature {
            return Err(PaymentError::InvalidData("webhook signature mismatch".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn submit_meter_event(&self, event: &MeterEvent) -> Result<MeterEventConfirmation> {
        let form = vec![
            ("event_name".to_string(), event.meter.clone()),
            ("identifier".to_string(), event.idempotency_key.clone()),
            ("timestamp".to_string(), event.timestamp.timestamp().to_string()),
            ("payload[stripe_customer_id]".to_string(), event.customer_id.clone()),
            ("payload[value]".to_string(), event.value.to_string()),
        ];

        // Stripe deduplicates on the identifier within a rolling window and
        // replays the original response when the Idempotency-Key repeats, so
        // a 2xx on a repeated key means "already counted", not double-billed.
        let _: serde_json::Value = self
            .post_form(
                "/v1/billing/meter_events",
                &form,
                Some(&event.idempotency_key),
                "submit meter event",
            )
            .await?;

        tracing::debug!(
            customer_id = %event.customer_id,
            meter = %event.meter,
            value = event.value,
            "submitted meter event to Stripe"
        );
        Ok(MeterEventConfirmation { already_recorded: false })
    }

    async fn get_subscription(&self, customer_id: &str) -> Result<Option<Subscription>> {
        match self.fetch_stripe_subscription(customer_id).await? {
            Some(sub) => Ok(Some(sub.into_subscription()?)),
            None => Ok(None),
        }
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        cancel_url: &str,
        success_url: &str,
    ) -> Result<String> {
        let form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), customer_id.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("line_items[0][price]".to_string(), price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];

        let session: StripeSession = self
            .post_form("/v1/checkout/sessions", &form, None, "create checkout session")
            .await?;

        tracing::info!("Created checkout session {} for customer {customer_id}", session.id);

        session.url.ok_or_else(|| {
            tracing::error!("Checkout session missing URL");
            PaymentError::ProviderApi("Checkout session missing URL".to_string())
        })
    }

    async fn update_subscription(&self, customer_id: &str, price_id: &str) -> Result<Subscription> {
        let current = self
            .fetch_stripe_subscription(customer_id)
            .await?
            .ok_or_else(|| PaymentError::NoSubscription(customer_id.to_string()))?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| PaymentError::InvalidData("subscription has no items".to_string()))?;

        let form = vec![
            ("items[0][id]".to_string(), item_id),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("cancel_at_period_end".to_string(), "false".to_string()),
            ("proration_behavior".to_string(), "create_prorations".to_string()),
        ];

        let updated: StripeSubscription = self
            .post_form(&format!("/v1/subscriptions/{}", current.id), &form, None, "update subscription")
            .await?;
        updated.into_subscription()
    }

    async fn cancel_subscription(&self, customer_id: &str) -> Result<Subscription> {
        let current = self
            .fetch_stripe_subscription(customer_id)
            .await?
            .ok_or_else(|| PaymentError::NoSubscription(customer_id.to_string()))?;

        let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
        let updated: StripeSubscription = self
            .post_form(&format!("/v1/subscriptions/{}", current.id), &form, None, "cancel subscription")
            .await?;
        updated.into_subscription()
    }

    async fn get_upcoming_invoice(&self, customer_id: &str) -> Result<UpcomingInvoice> {
        let invoice: StripeInvoice = self
            .get("/v1/invoices/upcoming", &[("customer", customer_id)], "upcoming invoice")
            .await?;

        Ok(UpcomingInvoice {
            amount_due: invoice.amount_due,
            currency: invoice.currency,
            period_end: invoice.period_end.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            lines: invoice.lines.data.into_iter().filter_map(|l| l.description).collect(),
        })
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()> {
        let form = vec![("customer".to_string(), customer_id.to_string())];
        let _: serde_json::Value = self
            .post_form(
                &format!("/v1/payment_methods/{payment_method_id}/attach"),
                &form,
                None,
                "attach payment method",
            )
            .await?;

        // Make it the default for invoices.
        let form = vec![(
            "invoice_settings[default_payment_method]".to_string(),
            payment_method_id.to_string(),
        )];
        let _: serde_json::Value = self
            .post_form(
                &format!("/v1/customers/{customer_id}"),
                &form,
                None,
                "set default payment method",
            )
            .await?;
        Ok(())
    }

    async fn create_billing_portal_session(&self, customer_id: &str, return_url: &str) -> Result<String> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        let session: StripeSession = self
            .post_form("/v1/billing_portal/sessions", &form, None, "create billing portal session")
            .await?;
        session
            .url
            .ok_or_else(|| PaymentError::ProviderApi("Portal session missing URL".to_string()))
    }

    async fn validate_webhook(&self, headers: &axum::http::HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let signature = headers
            .get("stripe-signature")
            .ok_or_else(|| {
                tracing::error!("Missing stripe-signature header");
                PaymentError::InvalidData("Missing stripe-signature header".to_string())
            })?
            .to_str()
            .map_err(|e| {
                tracing::error!("Invalid stripe-signature header: {:?}", e);
                PaymentError::InvalidData("Invalid stripe-signature header".to_string())
            })?;

        self.verify_signature(signature, body)?;

        #[derive(Deserialize)]
        struct EventObject {
            customer: Option<String>,
        }
        #[derive(Deserialize)]
        struct EventData {
            object: EventObject,
        }
        #[derive(Deserialize)]
        struct Event {
            #[serde(rename = "type")]
            event_type: String,
            data: EventData,
        }

        let event: Event = serde_json::from_str(body)
            .map_err(|e| PaymentError::InvalidData(format!("malformed webhook payload: {e}")))?;

        tracing::trace!("Validated Stripe webhook event: {}", event.event_type);

        Ok(Some(WebhookEvent {
            event_type: event.event_type,
            customer_id: event.data.object.customer,
        }))
    }

    async fn process_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        // Subscription lifecycle is read back from Stripe on demand; webhook
        // delivery only needs acknowledging so Stripe stops retrying.
        match event.event_type.as_str() {
            "customer.subscription.updated" | "customer.subscription.deleted" | "invoice.paid" => {
                tracing::info!(
                    event_type = %event.event_type,
                    customer_id = ?event.customer_id,
                    "acknowledged Stripe webhook"
                );
            }
            other => {
                tracing::debug!("Ignoring webhook event type: {other}");
            }
        }
        Ok(())
    }
}
