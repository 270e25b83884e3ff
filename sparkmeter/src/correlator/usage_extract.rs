//! Token-usage and model-name extraction from heterogeneous engine payloads.
//!
//! Providers report token usage under different shapes and casings. Rather
//! than scattering key probes through the correlator, extraction is an
//! ordered list of narrow extractor functions tried in priority order; the
//! first one that yields a non-empty result wins and nothing is summed
//! across sources. Adding a provider quirk means adding one extractor here.

use serde_json::Value;

/// Token counts pulled out of one model run's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

/// Read the first present numeric field among `keys` from a JSON object.
fn read_u64(object: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_u64))
        .unwrap_or(0)
}

fn usage_from_object(object: &Value) -> TokenUsage {
    let input = read_u64(object, &["input_tokens", "inputTokens", "prompt_tokens", "promptTokens"]);
    let output = read_u64(
        object,
        &["output_tokens", "outputTokens", "completion_tokens", "completionTokens"],
    );
    let total = read_u64(object, &["total_tokens", "totalTokens"]);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: if total > 0 { total } else { input + output },
    }
}

/// Structured usage object on the primary response message:
/// `generations[0][0].message.usage_metadata` (or `usageMetadata`).
fn from_message_usage(output: &Value) -> Option<TokenUsage> {
    let message = output
        .get("generations")?
        .get(0)?
        .get(0)?
        .get("message")?;
    let usage = message.get("usage_metadata").or_else(|| message.get("usageMetadata"))?;
    let extracted = usage_from_object(usage);
    (!extracted.is_empty()).then_some(extracted)
}

/// Provider-level token usage: `llmOutput.tokenUsage` (or
/// `llm_output.token_usage`).
fn from_llm_output(output: &Value) -> Option<TokenUsage> {
    let llm_output = output.get("llmOutput").or_else(|| output.get("llm_output"))?;
    let usage = llm_output
        .get("tokenUsage")
        .or_else(|| llm_output.get("token_usage"))?;
    let extracted = usage_from_object(usage);
    (!extracted.is_empty()).then_some(extracted)
}

/// Extractors in priority order. First non-empty result wins.
const EXTRACTORS: &[fn(&Value) -> Option<TokenUsage>] = &[from_message_usage, from_llm_output];

/// Extract token usage from a model run's output payload.
pub fn extract_token_usage(output: &Value) -> TokenUsage {
    EXTRACTORS
        .iter()
        .find_map(|extract| extract(output))
        .unwrap_or_default()
}

/// Resolve the model identifier for a run: explicit invocation parameter
/// first, tracing metadata fallback second, `"unknown"` last.
pub fn resolve_model(params: &Value, metadata: &Value) -> String {
    params
        .get("model")
        .and_then(Value::as_str)
        .or_else(|| metadata.get("ls_model_name").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string()
}
