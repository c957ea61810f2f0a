use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use super::{PendingQueue, SemanticEvent};
use crate::error::ChatError;
use crate::protocol::{CompletionChunk, FunctionCall, ToolCallFragment, ToolCallInvocation};

/// A tool call whose arguments are still arriving.
#[derive(Debug, Clone)]
struct OpenToolCall {
    index: Option<u32>,
    call: ToolCallInvocation,
}

impl OpenToolCall {
    fn open(fragment: &ToolCallFragment) -> Self {
        let function = fragment.function.as_ref();
        Self {
            index: fragment.index,
            call: ToolCallInvocation {
                id: fragment.id.clone().unwrap_or_default(),
                type_: fragment.type_.clone().unwrap_or_default(),
                function: FunctionCall {
                    name: function.and_then(|f| f.name.clone()).unwrap_or_default(),
                    arguments: String::new(),
                },
            },
        }
    }

    fn apply(&mut self, fragment: &ToolCallFragment) {
        if let Some(function) = fragment.function.as_ref() {
            if let Some(arguments) = function.arguments.as_deref() {
                self.call.function.arguments.push_str(arguments);
            }
            if let Some(name) = function.name.as_deref().filter(|name| !name.is_empty()) {
                name.clone_into(&mut self.call.function.name);
            }
        }
        if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
            id.clone_into(&mut self.call.id);
        }
        if let Some(type_) = fragment.type_.as_deref().filter(|type_| !type_.is_empty()) {
            type_.clone_into(&mut self.call.type_);
        }
    }
}

/// Turns completion chunks into semantic events.
///
/// Exactly one tool call is accumulated at a time: calls within one assistant
/// turn are reported back to back, never interleaved.
#[derive(Debug, Default)]
pub struct DeltaAggregator {
    current: Option<OpenToolCall>,
}

impl DeltaAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk, appending any resulting events to `out`.
    pub fn push_chunk(&mut self, chunk: CompletionChunk, out: &mut Vec<SemanticEvent>) {
        if chunk.is_tool_res_batch() {
            let messages = chunk.tool_res_messages.unwrap_or_default();
            debug!(count = messages.len(), "tool result batch received");
            out.push(SemanticEvent::ToolResMessages(messages));
            return;
        }

        let Some(choices) = chunk.choices else {
            return;
        };

        for choice in choices {
            let finished_with_tool_calls = choice.finished_with_tool_calls();
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content {
                    out.push(SemanticEvent::ContentDelta(content));
                }
                for fragment in delta.tool_calls.iter().flatten() {
                    self.apply_fragment(fragment, out);
                }
            }
            if finished_with_tool_calls {
                if let Some(open) = self.current.take() {
                    out.push(SemanticEvent::ToolCall(open.call));
                }
            }
        }
    }

    fn apply_fragment(&mut self, fragment: &ToolCallFragment, out: &mut Vec<SemanticEvent>) {
        let opens_new_call = match (&self.current, fragment.index) {
            // A different index while a call is open: that call is complete.
            (Some(open), Some(index)) => open.index.is_some_and(|open_index| open_index != index),
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => {
                warn!("tool call fragment without index and no open call, skipping");
                return;
            }
        };
        if opens_new_call {
            if let Some(finished) = self.current.replace(OpenToolCall::open(fragment)) {
                out.push(SemanticEvent::ToolCall(finished.call));
            }
        }
        if let Some(open) = self.current.as_mut() {
            open.apply(fragment);
        }
    }

    /// End of input. A call that never saw its finish reason is incomplete and
    /// is dropped.
    pub fn finish(&mut self) {
        if let Some(open) = self.current.take() {
            warn!(
                tool_call_id = %open.call.id,
                function = %open.call.function.name,
                "stream ended with an unfinished tool call, dropping it"
            );
        }
    }
}

/// Compose the aggregator over a chunk stream.
///
/// Errors from upstream stages pass through and end the stream.
pub fn semantic_event_stream<S>(chunks: S) -> impl Stream<Item = Result<SemanticEvent, ChatError>> + Send
where
    S: Stream<Item = Result<CompletionChunk, ChatError>> + Send + 'static,
{
    futures_util::stream::unfold(
        (
            Box::pin(chunks),
            DeltaAggregator::new(),
            Vec::<SemanticEvent>::with_capacity(4),
            PendingQueue::new(),
            false,
        ),
        |(mut chunks, mut aggregator, mut parsed, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (chunks, aggregator, parsed, pending, done)));
                }
                if done {
                    return None;
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        aggregator.push_chunk(chunk, &mut parsed);
                        pending.extend_from_vec(&mut parsed);
                    }
                    Some(Err(err)) => {
                        aggregator.finish();
                        done = true;
                        return Some((Err(err), (chunks, aggregator, parsed, pending, done)));
                    }
                    None => {
                        aggregator.finish();
                        done = true;
                    }
                }
            }
        },
    )
}
