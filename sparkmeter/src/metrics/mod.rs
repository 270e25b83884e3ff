//! Prometheus instruments for live execution observability.
//!
//! The correlator records model-call and chain aggregates here as they
//! complete. These are in-process observability numbers only; the billing
//! path recomputes everything from the telemetry source and never reads
//! these instruments.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

/// Instruments fed by the run correlator.
#[derive(Clone)]
pub struct SparkMetrics {
    /// Duration of individual model calls.
    model_call_duration: HistogramVec,
    /// Tokens per model call, split by token type.
    model_token_usage: HistogramVec,
    /// Wall-clock duration of whole chains.
    chain_duration: HistogramVec,
    /// Correlator entries evicted by the TTL sweep.
    orphaned_runs: IntCounter,
    registry: Registry,
}

impl SparkMetrics {
    /// Create the instruments and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        // 10ms to ~82s, exponential with factor 2.
        let duration_buckets = vec![
            0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
        ];
        let model_call_duration = HistogramVec::new(
            HistogramOpts::new("spark_model_call_duration_seconds", "Duration of one model invocation")
                .buckets(duration_buckets.clone()),
            &["model", "outcome"],
        )?;
        registry.register(Box::new(model_call_duration.clone()))?;

        // 1 to ~67M tokens, exponential with factor 4.
        let token_buckets = vec![
            1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
            4194304.0, 16777216.0, 67108864.0,
        ];
        let model_token_usage = HistogramVec::new(
            HistogramOpts::new("spark_model_token_usage", "Tokens consumed by one model invocation")
                .buckets(token_buckets),
            &["model", "token_type"],
        )?;
        registry.register(Box::new(model_token_usage.clone()))?;

        let chain_duration = HistogramVec::new(
            HistogramOpts::new("spark_chain_duration_seconds", "Wall-clock duration of one chain")
                .buckets(duration_buckets),
            &["outcome"],
        )?;
        registry.register(Box::new(chain_duration.clone()))?;

        let orphaned_runs = IntCounter::with_opts(Opts::new(
            "spark_correlator_orphaned_runs_total",
            "Correlator entries evicted without a matching end event",
        ))?;
        registry.register(Box::new(orphaned_runs.clone()))?;

        Ok(Self {
            model_call_duration,
            model_token_usage,
            chain_duration,
            orphaned_runs,
            registry: registry.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_model_call(&self, model: &str, outcome: &str, duration_seconds: f64) {
        self.model_call_duration
            .with_label_values(&[model, outcome])
            .observe(duration_seconds);
    }

    pub fn record_token_usage(&self, model: &str, token_type: &str, tokens: f64) {
        if tokens > 0.0 {
            self.model_token_usage
                .with_label_values(&[model, token_type])
                .observe(tokens);
        }
    }

    pub fn record_chain(&self, outcome: &str, duration_seconds: f64) {
        self.chain_duration.with_label_values(&[outcome]).observe(duration_seconds);
    }

    pub fn record_orphaned_runs(&self, count: u64) {
        self.orphaned_runs.inc_by(count);
    }
}
