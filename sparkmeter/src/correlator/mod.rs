//! Run correlator: live aggregation of execution-engine lifecycle events.
//!
//! The execution engine emits start/end/error events for every chain and
//! model call it runs. This module folds those events, in real time, into
//! per-chain aggregates (token totals, child durations, models used) and
//! emits structured records as chains and model calls complete. It is the
//! live, in-memory observability path; the billing path replays from the
//! telemetry source and never depends on this state.
//!
//! All state is keyed by engine-assigned, globally-unique run ids, so
//! concurrent request contexts never collide. Events are side-effect-only:
//! nothing here returns an error into the engine.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{
    metrics::SparkMetrics,
    types::{RunId, abbrev_id},
};

pub mod usage_extract;

pub use usage_extract::{TokenUsage, extract_token_usage, resolve_model};

/// One lifecycle unit as reported by the execution engine.
#[derive(Debug, Clone, Default)]
pub struct Run {
    /// Engine-assigned id, unique per run.
    pub id: RunId,
    /// Enclosing chain, if any.
    pub parent_id: Option<RunId>,
    pub name: String,
    /// Invocation parameters (model, temperature, ...).
    pub params: Value,
    pub metadata: Value,
    /// Output payload, present on end events.
    pub output: Option<Value>,
    /// Error payload, present on error events.
    pub error: Option<String>,
}

/// Lifecycle events the engine emits, dispatched to the listener.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ChainStart(Run),
    ChainEnd(Run),
    ChainError(Run),
    ModelStart(Run),
    ModelEnd(Run),
    ModelError(Run),
}

/// Listener seam the engine calls into. Registered at startup; implementors
/// must never block or panic on malformed event sequences.
pub trait ExecutionListener: Send + Sync {
    fn on_event(&self, event: ExecutionEvent);
}

/// Live accumulator for one in-flight chain.
#[derive(Debug, Clone)]
pub struct ChainAggregate {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Cumulative duration of child model calls (errors included).
    pub child_duration: Duration,
    pub models: BTreeSet<String>,
    pub model_calls: u64,
}

impl ChainAggregate {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            child_duration: Duration::ZERO,
            models: BTreeSet::new(),
            model_calls: 0,
        }
    }
}

/// Correlator state, explicitly injected rather than process-global.
#[derive(Default)]
struct CorrelatorState {
    /// Model-run start instants, keyed by run id. Entry removed on end/error.
    model_starts: DashMap<RunId, (Instant, DateTime<Utc>)>,
    /// Model run -> enclosing chain, for attribution on end.
    parent_links: DashMap<RunId, RunId>,
    /// In-flight chain aggregates, keyed by chain run id.
    aggregates: DashMap<RunId, ChainAggregate>,
    /// Root chain of the current logical trace.
    active_trace: ArcSwapOption<RunId>,
}

pub struct RunCorrelator {
    state: CorrelatorState,
    metrics: Option<SparkMetrics>,
}

impl RunCorrelator {
    pub fn new(metrics: Option<SparkMetrics>) -> Self {
        Self {
            state: CorrelatorState::default(),
            metrics,
        }
    }

    /// Currently active trace root, if a parentless chain is in flight.
    pub fn active_trace(&self) -> Option<RunId> {
        self.state.active_trace.load_full().map(|id| (*id).clone())
    }

    #[cfg(test)]
    fn aggregate(&self, chain_id: &str) -> Option<ChainAggregate> {
        self.state.aggregates.get(chain_id).map(|a| a.clone())
    }

    fn on_chain_start(&self, run: &Run) {
        if run.parent_id.is_none() {
            self.state.active_trace.store(Some(Arc::new(run.id.clone())));
        }
        self.state.aggregates.insert(run.id.clone(), ChainAggregate::new());
    }

    fn on_model_start(&self, run: &Run) {
        self.state
            .model_starts
            .insert(run.id.clone(), (Instant::now(), Utc::now()));
        if let Some(parent_id) = &run.parent_id
            && self.state.aggregates.contains_key(parent_id)
        {
            self.state.parent_links.insert(run.id.clone(), parent_id.clone());
        }
    }

    fn on_model_finish(&self, run: &Run, errored: bool) {
        // Both entries go regardless of what else happens below; this is the
        // bounded-memory invariant.
        let Some((_, (started_at, started_wall))) = self.state.model_starts.remove(&run.id) else {
            warn!(
                run_id = %abbrev_id(&run.id),
                "end event for unknown model run, dropping (ordering violation)"
            );
            return;
        };
        let parent = self.state.parent_links.remove(&run.id).map(|(_, chain)| chain);

        let duration = started_at.elapsed();
        let model = resolve_model(&run.params, &run.metadata);
        let usage = if errored {
            TokenUsage::default()
        } else {
            run.output.as_ref().map(extract_token_usage).unwrap_or_default()
        };

        if let Some(chain_id) = &parent {
            match self.state.aggregates.get_mut(chain_id) {
                Some(mut aggregate) => {
                    aggregate.child_duration += duration;
                    if !errored {
                        aggregate.input_tokens += usage.input_tokens;
                        aggregate.output_tokens += usage.output_tokens;
                        aggregate.total_tokens += usage.total_tokens;
                        aggregate.models.insert(model.clone());
                        aggregate.model_calls += 1;
                    }
                }
                None => {
                    // Parent ended first; its aggregate is already emitted
                    // and must not be amended after the fact.
                    warn!(
                        run_id = %abbrev_id(&run.id),
                        chain_id = %abbrev_id(chain_id),
                        "model run outlived its chain, contribution dropped (ordering violation)"
                    );
                }
            }
        }

        let outcome = if errored { "error" } else { "ok" };
        info!(
            run_id = %run.id,
            trace_id = ?self.active_trace(),
            chain_id = ?parent,
            model = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total_tokens,
            duration_ms = duration.as_millis() as u64,
            started_at = %started_wall,
            error = ?run.error,
            outcome,
            "model call finished"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_model_call(&model, outcome, duration.as_secs_f64());
            metrics.record_token_usage(&model, "input", usage.input_tokens as f64);
            metrics.record_token_usage(&model, "output", usage.output_tokens as f64);
        }
    }

    fn on_chain_finish(&self, run: &Run, errored: bool) {
        let Some((_, aggregate)) = self.state.aggregates.remove(&run.id) else {
            warn!(
                chain_id = %abbrev_id(&run.id),
                "end event for unknown chain, dropping (ordering violation)"
            );
            return;
        };

        let duration = aggregate.started_at.elapsed();
        let outcome = if errored { "error" } else { "ok" };
        info!(
            chain_id = %run.id,
            trace_id = ?self.active_trace(),
            input_tokens = aggregate.input_tokens,
            output_tokens = aggregate.output_tokens,
            total_tokens = aggregate.total_tokens,
            model_calls = aggregate.model_calls,
            models = ?aggregate.models,
            duration_ms = duration.as_millis() as u64,
            child_duration_ms = aggregate.child_duration.as_millis() as u64,
            started_at = %aggregate.started_wall,
            error = ?run.error,
            outcome,
            "chain finished"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_chain(outcome, duration.as_secs_f64());
        }

        // Clear the trace root only if this chain was it.
        let active = self.state.active_trace.load();
        if active.as_deref().is_some_and(|id| *id == run.id) {
            self.state.active_trace.store(None);
        }
    }

    /// Evict entries older than `max_age`. Returns how many were dropped.
    ///
    /// Malformed event sequences (a start without a matching end) would
    /// otherwise pin entries for the life of the process.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut dropped = 0;

        let stale: Vec<RunId> = self
            .state
            .model_starts
            .iter()
            .filter(|entry| entry.value().0.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for run_id in stale {
            self.state.model_starts.remove(&run_id);
            self.state.parent_links.remove(&run_id);
            dropped += 1;
        }

        let stale_chains: Vec<RunId> = self
            .state
            .aggregates
            .iter()
            .filter(|entry| entry.value().started_at.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for chain_id in stale_chains {
            self.state.aggregates.remove(&chain_id);
            let active = self.state.active_trace.load();
            if active.as_deref().is_some_and(|id| *id == chain_id) {
                self.state.active_trace.store(None);
            }
            dropped += 1;
        }

        if dropped > 0 {
            warn!(dropped, max_age_secs = max_age.as_secs(), "swept orphaned correlator entries");
            if let Some(metrics) = &self.metrics {
                metrics.record_orphaned_runs(dropped as u64);
            }
        }
        dropped
    }
}

impl ExecutionListener for RunCorrelator {
    fn on_event(&self, event: ExecutionEvent) {
        match &event {
            ExecutionEvent::ChainStart(run) => self.on_chain_start(run),
            ExecutionEvent::ChainEnd(run) => self.on_chain_finish(run, false),
            ExecutionEvent::ChainError(run) => self.on_chain_finish(run, true),
            ExecutionEvent::ModelStart(run) => self.on_model_start(run),
            ExecutionEvent::ModelEnd(run) => self.on_model_finish(run, false),
            ExecutionEvent::ModelError(run) => self.on_model_finish(run, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(id: &str, parent: Option<&str>) -> Run {
        Run {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            name: format!("chain-{id}"),
            ..Default::default()
        }
    }

    fn model_run(id: &str, parent: &str, model: &str, input: u64, output: u64) -> Run {
        Run {
            id: id.to_string(),
            parent_id: Some(parent.to_string()),
            name: format!("model-{id}"),
            params: json!({"model": model}),
            output: Some(json!({
                "llmOutput": {"tokenUsage": {"promptTokens": input, "completionTokens": output}}
            })),
            ..Default::default()
        }
    }

    fn correlator() -> RunCorrelator {
        RunCorrelator::new(None)
    }

    #[test]
    fn chain_aggregate_sums_children_order_independently() {
        let runs = [
            model_run("m1", "c1", "gpt-4o", 10, 5),
            model_run("m2", "c1", "claude-3", 20, 8),
            model_run("m3", "c1", "gpt-4o", 2, 1),
        ];

        // Same events, two completion orders; the aggregate must not care.
        for order in [[0usize, 1, 2], [2, 0, 1]] {
            let correlator = correlator();
            correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
            for run in &runs {
                correlator.on_event(ExecutionEvent::ModelStart(run.clone()));
            }
            for i in order {
                correlator.on_event(ExecutionEvent::ModelEnd(runs[i].clone()));
            }

            let aggregate = correlator.aggregate("c1").unwrap();
            assert_eq!(aggregate.input_tokens, 32);
            assert_eq!(aggregate.output_tokens, 14);
            assert_eq!(aggregate.total_tokens, 46);
            assert_eq!(aggregate.model_calls, 3);
            assert_eq!(
                aggregate.models,
                BTreeSet::from(["gpt-4o".to_string(), "claude-3".to_string()])
            );
        }
    }

    #[test]
    fn second_chain_end_is_a_noop() {
        let correlator = correlator();
        correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
        correlator.on_event(ExecutionEvent::ChainEnd(chain("c1", None)));
        // Does not panic, does not resurrect the aggregate.
        correlator.on_event(ExecutionEvent::ChainEnd(chain("c1", None)));
        assert!(correlator.aggregate("c1").is_none());
    }

    #[test]
    fn late_child_contribution_is_dropped() {
        let correlator = correlator();
        let run = model_run("m1", "c1", "gpt-4o", 10, 5);

        correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
        correlator.on_event(ExecutionEvent::ModelStart(run.clone()));
        correlator.on_event(ExecutionEvent::ChainEnd(chain("c1", None)));
        // Parent already emitted; this must clean up and not crash.
        correlator.on_event(ExecutionEvent::ModelEnd(run));

        assert!(correlator.state.model_starts.is_empty());
        assert!(correlator.state.parent_links.is_empty());
    }

    #[test]
    fn unknown_model_end_is_dropped() {
        let correlator = correlator();
        correlator.on_event(ExecutionEvent::ModelEnd(model_run("ghost", "c1", "gpt-4o", 1, 1)));
        assert!(correlator.state.model_starts.is_empty());
    }

    #[test]
    fn parentless_chain_is_the_trace_root() {
        let correlator = correlator();
        correlator.on_event(ExecutionEvent::ChainStart(chain("root", None)));
        correlator.on_event(ExecutionEvent::ChainStart(chain("nested", Some("root"))));

        assert_eq!(correlator.active_trace().as_deref(), Some("root"));

        correlator.on_event(ExecutionEvent::ChainEnd(chain("nested", Some("root"))));
        assert_eq!(correlator.active_trace().as_deref(), Some("root"));

        correlator.on_event(ExecutionEvent::ChainEnd(chain("root", None)));
        assert_eq!(correlator.active_trace(), None);
    }

    #[test]
    fn model_error_still_costs_chain_duration() {
        let correlator = correlator();
        let mut run = model_run("m1", "c1", "gpt-4o", 10, 5);
        run.output = None;
        run.error = Some("rate limited".to_string());

        correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
        correlator.on_event(ExecutionEvent::ModelStart(run.clone()));
        correlator.on_event(ExecutionEvent::ModelError(run));

        let aggregate = correlator.aggregate("c1").unwrap();
        assert_eq!(aggregate.total_tokens, 0);
        assert_eq!(aggregate.model_calls, 0);
        assert!(correlator.state.model_starts.is_empty());
    }

    #[test]
    fn finished_runs_leave_no_state_behind() {
        let correlator = correlator();
        let run = model_run("m1", "c1", "gpt-4o", 10, 5);

        correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
        correlator.on_event(ExecutionEvent::ModelStart(run.clone()));
        correlator.on_event(ExecutionEvent::ModelEnd(run));
        correlator.on_event(ExecutionEvent::ChainEnd(chain("c1", None)));

        assert!(correlator.state.model_starts.is_empty());
        assert!(correlator.state.parent_links.is_empty());
        assert!(correlator.state.aggregates.is_empty());
    }

    #[test]
    fn sweep_evicts_stale_entries() {
        let correlator = correlator();
        correlator.on_event(ExecutionEvent::ChainStart(chain("c1", None)));
        correlator.on_event(ExecutionEvent::ModelStart(model_run("m1", "c1", "gpt-4o", 0, 0)));

        // Nothing is older than an hour yet.
        assert_eq!(correlator.sweep(Duration::from_secs(3600)), 0);

        // With a zero threshold everything is stale.
        let dropped = correlator.sweep(Duration::ZERO);
        assert_eq!(dropped, 2);
        assert!(correlator.state.model_starts.is_empty());
        assert!(correlator.state.aggregates.is_empty());
        assert_eq!(correlator.active_trace(), None);
    }
}
