//! Billing reconciler: usage records into provider meter events.
//!
//! One meter event per record, submitted in input order. A failing
//! submission is isolated to its record: the failure is captured and the
//! remaining records still go out, so one bad customer cannot block the
//! window for everyone else.

use std::sync::Arc;
use tracing::{instrument, warn};

use crate::{
    billing::{FailedTrace, SkippedTrace},
    payment_providers::{MeterEvent, MeterEventConfirmation, PaymentProvider},
    types::{TraceId, abbrev_id},
};

use super::converter::UsageRecord;

/// Partitioned outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Trace ids whose meter event was newly recorded, in input order.
    pub processed: Vec<TraceId>,
    /// Traces the ledger had already counted.
    pub skipped: Vec<SkippedTrace>,
    /// Traces whose submission failed.
    pub failed: Vec<FailedTrace>,
    pub confirmations: Vec<MeterEventConfirmation>,
}

pub struct Reconciler {
    provider: Arc<dyn PaymentProvider>,
    /// Provider-side meter name usage is reported against.
    meter: String,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn PaymentProvider>, meter: String) -> Self {
        Self { provider, meter }
    }

    fn meter_event(&self, record: &UsageRecord) -> MeterEvent {
        MeterEvent {
            customer_id: record.customer_id.clone(),
            meter: self.meter.clone(),
            value: record.total_sparks,
            // Trace-derived key: re-syncing the same window re-submits the
            // same keys and the ledger collapses them.
            idempotency_key: format!("usage-{}", record.trace_id),
            timestamp: record.timestamp,
        }
    }

    /// Submit one meter event per record, isolating failures per record.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn reconcile(&self, records: &[UsageRecord]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for record in records {
            let event = self.meter_event(record);
            match self.provider.submit_meter_event(&event).await {
                Ok(confirmation) => {
                    if confirmation.already_recorded {
                        outcome.skipped.push(SkippedTrace {
                            trace_id: record.trace_id.clone(),
                            reason: "meter event already recorded".to_string(),
                        });
                    } else {
                        outcome.processed.push(record.trace_id.clone());
                    }
                    outcome.confirmations.push(confirmation);
                }
                Err(e) => {
                    warn!(
                        trace_id = %abbrev_id(&record.trace_id),
                        customer_id = %record.customer_id,
                        error = %e,
                        "meter event submission failed, continuing with remaining records"
                    );
                    outcome.failed.push(FailedTrace {
                        trace_id: record.trace_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }
}
