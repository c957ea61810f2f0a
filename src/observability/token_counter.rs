use crate::protocol::{CompletionRequest, Usage};
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text` for the given model.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str, _model: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate the total input tokens for a completion request.
///
/// Sums tokens from message text, tool-call arguments and serialized tool
/// definitions.
#[must_use]
pub fn estimate_request_tokens(request: &CompletionRequest) -> u64 {
    let model = &request.model;
    let mut total: u64 = 0;

    for msg in &request.messages {
        total += estimate_tokens(&msg.content, model);
        for call in msg.tool_calls.iter().flatten() {
            total += estimate_tokens(&call.function.name, model);
            total += estimate_tokens(&call.function.arguments, model);
        }
    }

    for tool in &request.tools {
        if let Some(ref parameters) = tool.function.parameters {
            if let Ok(serialized) = serde_json::to_string(parameters) {
                total += estimate_tokens(&serialized, model);
            }
        }
        if let Some(ref desc) = tool.function.description {
            total += estimate_tokens(desc, model);
        }
        total += estimate_tokens(&tool.function.name, model);
    }

    total
}

/// Merge upstream-reported usage with local estimates.
///
/// Upstream non-zero values win; missing or zero fields are filled from the
/// estimates and the total is recomputed when absent.
#[must_use]
pub fn merge_usage(upstream: Option<&Usage>, estimated_input: u64, estimated_output: u64) -> Usage {
    let upstream = upstream.copied().unwrap_or_default();
    let prompt_tokens = if upstream.prompt_tokens > 0 {
        upstream.prompt_tokens
    } else {
        estimated_input
    };
    let completion_tokens = if upstream.completion_tokens > 0 {
        upstream.completion_tokens
    } else {
        estimated_output
    };
    let total_tokens = if upstream.total_tokens > 0 {
        upstream.total_tokens
    } else {
        prompt_tokens + completion_tokens
    };
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}

/// Counters collected while a turn streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnStats {
    /// Completion requests issued, including tool-loop follow-ups.
    pub rounds: usize,
    pub content_bytes: usize,
    pub tool_calls: usize,
    pub tool_results: usize,
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
}

impl TurnStats {
    pub fn record_request(&mut self, request: &CompletionRequest) {
        self.rounds += 1;
        self.estimated_input_tokens += estimate_request_tokens(request);
    }

    pub fn record_content(&mut self, text: &str, model: &str) {
        self.content_bytes += text.len();
        self.estimated_output_tokens += estimate_tokens(text, model);
    }
}

/// Log statistics for a finished turn at INFO level.
pub fn log_turn_usage(chat_id: &str, model: &str, stats: &TurnStats, duration: Duration) {
    info!(
        chat_id = chat_id,
        model = model,
        rounds = stats.rounds,
        content_bytes = stats.content_bytes,
        tool_calls = stats.tool_calls,
        tool_results = stats.tool_results,
        estimated_input_tokens = stats.estimated_input_tokens,
        estimated_output_tokens = stats.estimated_output_tokens,
        duration_seconds = duration.as_secs_f64(),
        "turn completed"
    );
}

/// Log token usage for a single non-streaming request at INFO level.
pub fn log_request_usage(model: &str, purpose: &str, usage: &Usage, duration: Duration) {
    info!(
        model = model,
        purpose = purpose,
        input_tokens = usage.prompt_tokens,
        output_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
