//! Billing orchestration: fetch, convert, reconcile.
//!
//! [`BillingService`] is the seam between the HTTP surface and the three
//! billing stages. Its central guarantee is that `sync_usage` never errors
//! past this boundary: whatever happens downstream, callers get a structured
//! [`SyncResult`] describing what was billed, what was skipped, and what
//! failed. Scheduled retries then stay trivial (call again, idempotency
//! handles the rest).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;

use crate::{
    payment_providers::{
        MeterEventConfirmation, PaymentProvider, Subscription, UpcomingInvoice, WebhookEvent,
    },
    traces::{UsageFetcher, current_period_start},
    types::{CustomerId, TraceId},
};

pub mod converter;
pub mod reconciler;

pub use converter::{ConverterConfig, ModelUsage, UsageDetail, UsageRecord, convert};
pub use reconciler::Reconciler;

/// A trace whose meter event could not be recorded.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailedTrace {
    pub trace_id: TraceId,
    pub error: String,
}

/// A trace deliberately not billed in this pass.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SkippedTrace {
    pub trace_id: TraceId,
    pub reason: String,
}

/// Outcome of one sync pass. Constructed fresh per call; never persisted.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct SyncResult {
    /// Traces billed in this pass, in fetch order.
    pub processed_traces: Vec<TraceId>,
    pub failed_traces: Vec<FailedTrace>,
    pub skipped_traces: Vec<SkippedTrace>,
    pub meter_events: Vec<MeterEventConfirmation>,
}

/// Current-period usage for one customer, computed on demand.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageStats {
    pub customer_id: CustomerId,
    pub ai_tokens_sparks: u64,
    pub compute_sparks: u64,
    pub storage_sparks: u64,
    pub total_sparks: u64,
    pub total_cost_usd: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// A subscription together with what it has consumed so far this period.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionWithUsage {
    pub subscription: Option<Subscription>,
    pub usage: UsageStats,
}

pub struct BillingService {
    fetcher: UsageFetcher,
    converter_config: ConverterConfig,
    reconciler: Reconciler,
    provider: Arc<dyn PaymentProvider>,
}

impl BillingService {
    pub fn new(
        fetcher: UsageFetcher,
        converter_config: ConverterConfig,
        provider: Arc<dyn PaymentProvider>,
        meter: String,
    ) -> Self {
        Self {
            fetcher,
            converter_config,
            reconciler: Reconciler::new(provider.clone(), meter),
            provider,
        }
    }

    /// Bill the current period's traces, or just the named one.
    ///
    /// Never returns an error: a total fetch failure collapses into a single
    /// failed-trace entry keyed by the requested id (or `"unknown"` for a
    /// whole-window sync), everything else is reported per trace.
    #[instrument(skip(self))]
    pub async fn sync_usage(&self, trace_id: Option<String>) -> SyncResult {
        let since = current_period_start(Utc::now());

        let details = match self.fetcher.fetch(since, trace_id.as_deref()).await {
            Ok(details) => details,
            Err(e) => {
                error!(error = %e, "usage fetch failed, nothing billed this pass");
                return SyncResult {
                    failed_traces: vec![FailedTrace {
                        trace_id: trace_id.unwrap_or_else(|| "unknown".to_string()),
                        error: e.to_string(),
                    }],
                    ..Default::default()
                };
            }
        };

        let mut result = SyncResult::default();
        let mut records = Vec::with_capacity(details.len());
        for detail in &details {
            // An explicitly requested trace bypasses the fetcher's no-op
            // filter; report it as skipped instead of billing zeros.
            if detail.trace.is_noop() {
                result.skipped_traces.push(SkippedTrace {
                    trace_id: detail.trace.id.clone(),
                    reason: "no billable usage".to_string(),
                });
                continue;
            }
            if let Some(record) = convert(detail, &self.converter_config) {
                records.push(record);
            }
        }

        let outcome = self.reconciler.reconcile(&records).await;
        result.processed_traces = outcome.processed;
        result.skipped_traces.extend(outcome.skipped);
        result.failed_traces.extend(outcome.failed);
        result.meter_events = outcome.confirmations;

        info!(
            processed = result.processed_traces.len(),
            skipped = result.skipped_traces.len(),
            failed = result.failed_traces.len(),
            "usage sync finished"
        );
        result
    }

    /// Current-period spark totals for one customer, recomputed from the
    /// telemetry source each call.
    pub async fn get_usage_stats(&self, customer_id: &str) -> crate::errors::Result<UsageStats> {
        let now = Utc::now();
        let period_start = current_period_start(now);

        let details = self.fetcher.fetch(period_start, None).await?;

        let mut stats = UsageStats {
            customer_id: customer_id.to_string(),
            ai_tokens_sparks: 0,
            compute_sparks: 0,
            storage_sparks: 0,
            total_sparks: 0,
            total_cost_usd: 0.0,
            period_start,
            period_end: now,
        };
        for detail in &details {
            let Some(record) = convert(detail, &self.converter_config) else {
                continue;
            };
            if record.customer_id != customer_id {
                continue;
            }
            stats.ai_tokens_sparks += record.ai_tokens_sparks;
            stats.compute_sparks += record.compute_sparks;
            stats.storage_sparks += record.storage_sparks;
            stats.total_sparks += record.total_sparks;
            stats.total_cost_usd += detail.trace.total_cost_usd.unwrap_or(0.0);
        }
        Ok(stats)
    }

    pub async fn get_subscription_with_usage(
        &self,
        customer_id: &str,
    ) -> crate::errors::Result<SubscriptionWithUsage> {
        let subscription = self.provider.get_subscription(customer_id).await?;
        let usage = self.get_usage_stats(customer_id).await?;
        Ok(SubscriptionWithUsage { subscription, usage })
    }

    // Subscription and payment-method management delegates to the provider;
    // the service only contributes the crate-wide error mapping.

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        cancel_url: &str,
        success_url: &str,
    ) -> crate::errors::Result<String> {
        Ok(self
            .provider
            .create_checkout_session(customer_id, price_id, cancel_url, success_url)
            .await?)
    }

    pub async fn update_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> crate::errors::Result<Subscription> {
        Ok(self.provider.update_subscription(customer_id, price_id).await?)
    }

    pub async fn cancel_subscription(&self, customer_id: &str) -> crate::errors::Result<Subscription> {
        Ok(self.provider.cancel_subscription(customer_id).await?)
    }

    pub async fn get_upcoming_invoice(&self, customer_id: &str) -> crate::errors::Result<UpcomingInvoice> {
        Ok(self.provider.get_upcoming_invoice(customer_id).await?)
    }

    pub async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> crate::errors::Result<()> {
        Ok(self
            .provider
            .attach_payment_method(customer_id, payment_method_id)
            .await?)
    }

    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> crate::errors::Result<String> {
        Ok(self
            .provider
            .create_billing_portal_session(customer_id, return_url)
            .await?)
    }

    pub async fn validate_webhook(
        &self,
        headers: &axum::http::HeaderMap,
        body: &str,
    ) -> crate::errors::Result<Option<WebhookEvent>> {
        Ok(self.provider.validate_webhook(headers, body).await?)
    }

    pub async fn process_webhook_event(&self, event: &WebhookEvent) -> crate::errors::Result<()> {
        Ok(self.provider.process_webhook_event(event).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DummyConfig;
    use crate::payment_providers::dummy::DummyProvider;
    use crate::traces::{
        FetchError, Observation, ObservationUsage, PageMeta, Trace, TraceDetail, TracePage,
        TraceSource,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticSource {
        traces: Vec<TraceDetail>,
        fail_listing: bool,
    }

    #[async_trait]
    impl TraceSource for StaticSource {
        async fn fetch_traces(
            &self,
            _from: DateTime<Utc>,
            _page_size: u32,
            _page: u32,
        ) -> Result<TracePage, FetchError> {
            if self.fail_listing {
                return Err(FetchError::Parse("listing exploded".to_string()));
            }
            Ok(TracePage {
                data: self.traces.iter().map(|d| d.trace.clone()).collect(),
                meta: PageMeta { total_pages: 1 },
            })
        }

        async fn fetch_trace(&self, id: &str) -> Result<TraceDetail, FetchError> {
            self.traces
                .iter()
                .find(|d| d.trace.id == id)
                .cloned()
                .ok_or_else(|| FetchError::Parse(format!("no such trace {id}")))
        }
    }

    fn detail(id: &str, cost: f64, latency: f64, tokens: u64) -> TraceDetail {
        TraceDetail {
            trace: Trace {
                id: id.to_string(),
                timestamp: Utc::now(),
                latency_ms: Some(latency),
                total_cost_usd: Some(cost),
                metadata: json!({"customerId": "cus_1"}),
            },
            observations: vec![Observation {
                model: Some("gpt-4o".to_string()),
                usage: Some(ObservationUsage {
                    input: None,
                    output: None,
                    total: Some(tokens),
                }),
                calculated_total_cost_usd: Some(cost),
            }],
        }
    }

    fn service(source: StaticSource) -> BillingService {
        let provider = Arc::new(DummyProvider::from(DummyConfig { fail_customers: vec![] }));
        BillingService::new(
            UsageFetcher::new(Arc::new(source), 100),
            ConverterConfig {
                usd_to_sparks: 1000,
                default_customer_id: "cus_default".to_string(),
            },
            provider,
            "ai_sparks".to_string(),
        )
    }

    #[tokio::test]
    async fn sync_bills_the_window_and_repeat_skips() {
        let service = service(StaticSource {
            traces: vec![detail("t1", 0.002, 2000.0, 150), detail("t2", 0.01, 500.0, 900)],
            fail_listing: false,
        });

        let first = service.sync_usage(None).await;
        assert_eq!(first.processed_traces, vec!["t1", "t2"]);
        assert!(first.failed_traces.is_empty());

        let second = service.sync_usage(None).await;
        assert!(second.processed_traces.is_empty());
        assert_eq!(second.skipped_traces.len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_becomes_single_failed_entry() {
        let service = service(StaticSource {
            traces: vec![],
            fail_listing: true,
        });

        let result = service.sync_usage(None).await;
        assert!(result.processed_traces.is_empty());
        assert_eq!(result.failed_traces.len(), 1);
        assert_eq!(result.failed_traces[0].trace_id, "unknown");
    }

    #[tokio::test]
    async fn requested_noop_trace_is_reported_skipped() {
        let noop = TraceDetail {
            trace: Trace {
                id: "quiet".to_string(),
                timestamp: Utc::now(),
                latency_ms: Some(0.0),
                total_cost_usd: Some(0.0),
                metadata: json!({}),
            },
            observations: vec![],
        };
        let service = service(StaticSource {
            traces: vec![noop],
            fail_listing: false,
        });

        let result = service.sync_usage(Some("quiet".to_string())).await;
        assert!(result.processed_traces.is_empty());
        assert_eq!(result.skipped_traces.len(), 1);
        assert_eq!(result.skipped_traces[0].reason, "no billable usage");
    }

    #[tokio::test]
    async fn stats_sum_only_the_requesting_customer() {
        let mut other = detail("t9", 0.5, 1000.0, 100);
        other.trace.metadata = json!({"customerId": "cus_other"});
        let service = service(StaticSource {
            traces: vec![detail("t1", 0.002, 2000.0, 150), other],
            fail_listing: false,
        });

        let stats = service.get_usage_stats("cus_1").await.unwrap();
        assert_eq!(stats.ai_tokens_sparks, 2);
        assert_eq!(stats.compute_sparks, 2);
        assert_eq!(stats.total_sparks, 4);
        assert!((stats.total_cost_usd - 0.002).abs() < f64::EPSILON);
    }
}
