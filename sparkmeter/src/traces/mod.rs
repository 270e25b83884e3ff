//! Telemetry-source collaborator: completed execution traces.
//!
//! The telemetry collector owns trace storage; this module only defines the
//! narrow read interface the billing path needs ([`TraceSource`]) plus the
//! [`UsageFetcher`], which assembles the billing window: page through
//! completed traces since the start of the current billing period, drop
//! no-op traces, and enrich each survivor with its observations so that the
//! converter can stay a pure function over a fully-populated trace.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

pub mod http;

pub use http::HttpTraceSource;

use crate::types::TraceId;

/// Errors while retrieving traces from the telemetry source.
///
/// Any variant is fatal to the sync call that triggered the fetch: billing
/// from an incomplete page set risks under-billing silently, so the whole
/// window is retried instead.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("telemetry source request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("telemetry source returned {status} for {context}")]
    Status {
        status: reqwest::StatusCode,
        context: String,
    },

    #[error("failed to parse telemetry source response: {0}")]
    Parse(String),
}

/// One completed execution record, as reported by the telemetry source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: TraceId,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock latency of the whole trace. Missing or null when the
    /// source never measured it.
    #[serde(rename = "latencyMs", default)]
    pub latency_ms: Option<f64>,
    /// Aggregate attributed cost. Missing when cost attribution failed.
    #[serde(rename = "totalCostUSD", default)]
    pub total_cost_usd: Option<f64>,
    /// Pass-through metadata (customer attribution lives here).
    #[serde(default)]
    pub metadata: Value,
}

impl Trace {
    /// True when the trace carries neither cost nor latency - a no-op trace
    /// that must never reach billing.
    pub fn is_noop(&self) -> bool {
        self.total_cost_usd.unwrap_or(0.0) == 0.0 && self.latency_ms.unwrap_or(0.0) == 0.0
    }
}

/// Token usage reported for one observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationUsage {
    #[serde(default)]
    pub input: Option<u64>,
    #[serde(default)]
    pub output: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

impl ObservationUsage {
    /// Total tokens, falling back to input + output when the source omitted
    /// the precomputed total.
    pub fn total_tokens(&self) -> u64 {
        self.total
            .unwrap_or_else(|| self.input.unwrap_or(0) + self.output.unwrap_or(0))
    }
}

/// One model-call record within a trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<ObservationUsage>,
    #[serde(rename = "calculatedTotalCostUSD", default)]
    pub calculated_total_cost_usd: Option<f64>,
}

/// A trace together with its child observations, as returned by the
/// single-trace endpoint. This is the unit the converter consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDetail {
    #[serde(flatten)]
    pub trace: Trace,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
}

/// One page of the trace listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TracePage {
    pub data: Vec<Trace>,
    pub meta: PageMeta,
}

/// Read-only interface to the telemetry source.
#[async_trait]
pub trait TraceSource: Send + Sync {
    /// Fetch one page of traces recorded at or after `from`. Pages are
    /// 1-indexed; order within and across pages is source-defined and must
    /// be preserved by callers.
    async fn fetch_traces(
        &self,
        from: DateTime<Utc>,
        page_size: u32,
        page: u32,
    ) -> Result<TracePage, FetchError>;

    /// Fetch one trace with its observations.
    async fn fetch_trace(&self, id: &str) -> Result<TraceDetail, FetchError>;
}

/// First instant of the billing period containing `now` (first of the
/// current month, 00:00 UTC).
pub fn current_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .expect("first of the current month is a valid date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time");
    DateTime::from_naive_utc_and_offset(first, Utc)
}

/// Pulls the window of completed traces the sync path bills from.
#[derive(Clone)]
pub struct UsageFetcher {
    source: Arc<dyn TraceSource>,
    page_size: u32,
}

impl UsageFetcher {
    pub fn new(source: Arc<dyn TraceSource>, page_size: u32) -> Self {
        Self { source, page_size }
    }

    /// Fetch completed traces since `since`, or exactly one trace when an id
    /// is given (no pagination, no no-op filter - the caller asked for it
    /// explicitly and decides how to report it).
    ///
    /// The list path filters out traces with zero cost AND zero latency
    /// before the per-trace detail fetch, both to keep no-op traces out of
    /// billing and to avoid pointless detail requests.
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        since: DateTime<Utc>,
        trace_id: Option<&str>,
    ) -> Result<Vec<TraceDetail>, FetchError> {
        if let Some(id) = trace_id {
            let detail = self.source.fetch_trace(id).await?;
            return Ok(vec![detail]);
        }

        let mut traces = Vec::new();
        let mut page = 1;
        loop {
            let batch = self.source.fetch_traces(since, self.page_size, page).await?;
            let total_pages = batch.meta.total_pages;
            traces.extend(batch.data);
            if page >= total_pages {
                break;
            }
            page += 1;
        }

        let billable: Vec<Trace> = traces.into_iter().filter(|t| !t.is_noop()).collect();
        debug!(count = billable.len(), "fetched billable traces");

        // Sequential detail fetches: rate-limit friendly, and order must
        // follow the source-reported listing order.
        let mut details = Vec::with_capacity(billable.len());
        for trace in billable {
            details.push(self.source.fetch_trace(&trace.id).await?);
        }
        Ok(details)
    }
}
