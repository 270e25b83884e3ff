//! Usage converter: completed traces into billing-unit ("spark") records.
//!
//! Pure and deterministic: the same trace always converts to the same record,
//! so a replayed sync produces identical meter events and the ledger's
//! idempotency collapses them. All pricing knobs live in [`ConverterConfig`];
//! nothing here does IO.
//!
//! Spark arithmetic, in full:
//! - per model: `max(ceil(cost_usd × usd_to_sparks), max(1, ceil(tokens / 100)))`,
//!   counted only for observations that actually carried usage;
//! - ai_tokens: sum of per-model sparks, with a trace-cost fallback when no
//!   observation was usable, and a floor of total observation tokens / 100
//!   when they were;
//! - compute: latency converted to seconds, minimum 1;
//! - storage: reserved, always 0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::{
    traces::TraceDetail,
    types::{CustomerId, TraceId},
};

/// Tokens per spark for the token-floor arm of the arithmetic.
const TOKENS_PER_SPARK: f64 = 100.0;

/// Pricing knobs for the conversion.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Sparks per US dollar of attributed cost.
    pub usd_to_sparks: u64,
    /// Customer to attribute traces that carry no `customerId` metadata.
    pub default_customer_id: CustomerId,
}

/// Per-model slice of a usage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModelUsage {
    pub model: String,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub sparks: u64,
}

/// Raw usage behind the spark numbers, kept for auditability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageDetail {
    /// Token total across every observation, usable or not.
    pub total_tokens: u64,
    pub models: Vec<ModelUsage>,
    pub compute_minutes: f64,
}

/// One trace's billing outcome. Immutable; created once per trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageRecord {
    pub trace_id: TraceId,
    pub customer_id: CustomerId,
    pub subscription_tier: String,
    pub timestamp: DateTime<Utc>,
    pub ai_tokens_sparks: u64,
    pub compute_sparks: u64,
    pub storage_sparks: u64,
    pub total_sparks: u64,
    pub detail: UsageDetail,
    /// Trace metadata carried through untouched.
    #[schema(value_type = Object)]
    pub metadata: Value,
}

fn string_field(metadata: &Value, key: &str) -> Option<String> {
    metadata.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Convert a completed trace into a usage record.
///
/// Returns `None` for traces that cannot be billed at all: empty id, or
/// missing cost or latency measurements. Those are dropped silently rather
/// than reported as failures, matching how half-instrumented traces are
/// treated upstream.
pub fn convert(detail: &TraceDetail, config: &ConverterConfig) -> Option<UsageRecord> {
    let trace = &detail.trace;
    if trace.id.is_empty() {
        return None;
    }
    let trace_cost = trace.total_cost_usd?;
    let latency_ms = trace.latency_ms?;

    let rate = config.usd_to_sparks as f64;

    // Fold observations per model. BTreeMap keeps the breakdown ordering
    // stable across runs, which the determinism guarantee depends on.
    let mut per_model: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    let mut all_observation_tokens: u64 = 0;
    for obs in &detail.observations {
        let tokens = obs.usage.as_ref().map(|u| u.total_tokens()).unwrap_or(0);
        all_observation_tokens += tokens;

        let model = match &obs.model {
            Some(m) if !m.is_empty() => m.clone(),
            _ => continue,
        };
        let cost = obs.calculated_total_cost_usd.unwrap_or(0.0);

        // Observations that carried no usage at all contribute nothing;
        // without this, an instrumented-but-idle model call would still
        // bill its 1-spark floor.
        if cost <= 0.0 && tokens == 0 {
            continue;
        }

        let entry = per_model.entry(model).or_insert((0, 0.0));
        entry.0 += tokens;
        entry.1 += cost;
    }

    let models: Vec<ModelUsage> = per_model
        .into_iter()
        .map(|(model, (tokens, cost))| {
            let cost_sparks = (cost * rate).ceil() as u64;
            let token_sparks = ((tokens as f64 / TOKENS_PER_SPARK).ceil() as u64).max(1);
            ModelUsage {
                model,
                total_tokens: tokens,
                cost_usd: cost,
                sparks: cost_sparks.max(token_sparks),
            }
        })
        .collect();

    let per_model_sum: u64 = models.iter().map(|m| m.sparks).sum();
    let ai_tokens_sparks = if per_model_sum == 0 {
        if trace_cost > 0.0 {
            (((trace_cost * rate).ceil()) as u64).max(1)
        } else {
            0
        }
    } else {
        per_model_sum.max((all_observation_tokens as f64 / TOKENS_PER_SPARK).ceil() as u64)
    };

    let compute_minutes = latency_ms / 60_000.0;
    let compute_sparks = ((compute_minutes * 60.0).ceil() as u64).max(1);
    let storage_sparks = 0;

    Some(UsageRecord {
        trace_id: trace.id.clone(),
        customer_id: string_field(&trace.metadata, "customerId")
            .unwrap_or_else(|| config.default_customer_id.clone()),
        subscription_tier: string_field(&trace.metadata, "subscriptionTier")
            .unwrap_or_else(|| "free".to_string()),
        timestamp: trace.timestamp,
        ai_tokens_sparks,
        compute_sparks,
        storage_sparks,
        total_sparks: ai_tokens_sparks + compute_sparks + storage_sparks,
        detail: UsageDetail {
            total_tokens: all_observation_tokens,
            models,
            compute_minutes,
        },
        metadata: trace.metadata.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traces::{Observation, ObservationUsage, Trace};
    use serde_json::json;

    fn config() -> ConverterConfig {
        ConverterConfig {
            usd_to_sparks: 1000,
            default_customer_id: "cus_default".to_string(),
        }
    }

    fn trace(id: &str, cost: Option<f64>, latency: Option<f64>) -> Trace {
        Trace {
            id: id.to_string(),
            timestamp: Utc::now(),
            latency_ms: latency,
            total_cost_usd: cost,
            metadata: json!({"customerId": "cus_1", "subscriptionTier": "pro"}),
        }
    }

    fn observation(model: &str, tokens: u64, cost: f64) -> Observation {
        Observation {
            model: Some(model.to_string()),
            usage: Some(ObservationUsage {
                input: None,
                output: None,
                total: Some(tokens),
            }),
            calculated_total_cost_usd: Some(cost),
        }
    }

    #[test]
    fn small_trace_bills_cost_and_latency() {
        // 0.002 USD and 150 tokens across one model, 2 seconds of latency:
        // ai = max(ceil(0.002*1000), ceil(150/100)) = 2, compute = 2.
        let detail = TraceDetail {
            trace: trace("t1", Some(0.002), Some(2000.0)),
            observations: vec![observation("gpt-4o", 150, 0.002)],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.ai_tokens_sparks, 2);
        assert_eq!(record.compute_sparks, 2);
        assert_eq!(record.storage_sparks, 0);
        assert_eq!(record.total_sparks, 4);
        assert_eq!(record.customer_id, "cus_1");
        assert_eq!(record.subscription_tier, "pro");
    }

    #[test]
    fn zero_usage_observations_fall_back_to_trace_cost() {
        // Observations exist but none carried usage, so the trace-level cost
        // fallback applies: ceil(0.01 * 1000) = 10.
        let detail = TraceDetail {
            trace: trace("t2", Some(0.01), Some(500.0)),
            observations: vec![
                observation("gpt-4o", 0, 0.0),
                observation("claude-3", 0, 0.0),
            ],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.ai_tokens_sparks, 10);
        assert!(record.detail.models.is_empty());
    }

    #[test]
    fn token_floor_lifts_cheap_heavy_traces() {
        // 1 spark of cost but 450 tokens: the token floor ceil(450/100) = 5
        // wins over the per-model sum.
        let detail = TraceDetail {
            trace: trace("t3", Some(0.0005), Some(100.0)),
            observations: vec![observation("gpt-4o-mini", 450, 0.0005)],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.ai_tokens_sparks, 5);
    }

    #[test]
    fn compute_sparks_never_below_one() {
        let detail = TraceDetail {
            trace: trace("t4", Some(0.001), Some(3.0)),
            observations: vec![],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.compute_sparks, 1);
        assert!(record.total_sparks >= 1);
    }

    #[test]
    fn missing_measurements_drop_the_trace() {
        let no_cost = TraceDetail {
            trace: trace("t5", None, Some(100.0)),
            observations: vec![],
        };
        let no_latency = TraceDetail {
            trace: trace("t6", Some(0.01), None),
            observations: vec![],
        };
        let no_id = TraceDetail {
            trace: trace("", Some(0.01), Some(100.0)),
            observations: vec![],
        };

        assert!(convert(&no_cost, &config()).is_none());
        assert!(convert(&no_latency, &config()).is_none());
        assert!(convert(&no_id, &config()).is_none());
    }

    #[test]
    fn missing_attribution_uses_defaults() {
        let mut t = trace("t7", Some(0.001), Some(100.0));
        t.metadata = json!({});
        let detail = TraceDetail {
            trace: t,
            observations: vec![],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.customer_id, "cus_default");
        assert_eq!(record.subscription_tier, "free");
    }

    #[test]
    fn conversion_is_deterministic() {
        let detail = TraceDetail {
            trace: trace("t8", Some(0.42), Some(12_345.0)),
            observations: vec![
                observation("gpt-4o", 900, 0.3),
                observation("claude-3", 200, 0.12),
                observation("gpt-4o", 100, 0.0),
            ],
        };

        let first = convert(&detail, &config()).unwrap();
        let second = convert(&detail, &config()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn multiple_observations_of_one_model_merge() {
        let detail = TraceDetail {
            trace: trace("t9", Some(0.004), Some(100.0)),
            observations: vec![
                observation("gpt-4o", 120, 0.002),
                observation("gpt-4o", 80, 0.002),
            ],
        };

        let record = convert(&detail, &config()).unwrap();
        assert_eq!(record.detail.models.len(), 1);
        assert_eq!(record.detail.models[0].total_tokens, 200);
        // max(ceil(0.004*1000)=4, max(1, ceil(200/100))=2) = 4
        assert_eq!(record.detail.models[0].sparks, 4);
    }
}
