pub mod aggregator;
pub mod decoder;
pub mod sse;

pub use aggregator::{semantic_event_stream, DeltaAggregator};
pub use decoder::{chunk_stream, decode_line, DecodedLine, DATA_PREFIX, DONE_SENTINEL};
pub use sse::{line_stream, LineFramer};

use smallvec::SmallVec;

use crate::protocol::{Message, ToolCallInvocation};

/// Aggregator output: what the conversation driver applies to a chat.
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticEvent {
    /// A fragment of assistant text, in arrival order.
    ContentDelta(String),
    /// A fully assembled tool call.
    ToolCall(ToolCallInvocation),
    /// Ready-made messages injected by the server after running tools.
    ToolResMessages(Vec<Message>),
}

impl SemanticEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SemanticEvent::ContentDelta(_) => "content_delta",
            SemanticEvent::ToolCall(_) => "tool_call",
            SemanticEvent::ToolResMessages(_) => "tool_res_messages",
        }
    }
}

/// FIFO of items produced by one upstream read and handed out one per poll.
pub(crate) struct PendingQueue<T> {
    items: SmallVec<[Option<T>; 8]>,
    head: usize,
}

impl<T> PendingQueue<T> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            items: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<T> {
        if self.head >= self.items.len() {
            return None;
        }
        let item = self.items[self.head].take();
        self.head += 1;
        if self.head == self.items.len() {
            self.items.clear();
            self.head = 0;
        }
        item
    }

    #[inline]
    pub(crate) fn extend_from_vec(&mut self, parsed: &mut Vec<T>) {
        if parsed.is_empty() {
            return;
        }
        self.items.reserve(parsed.len());
        self.items.extend(parsed.drain(..).map(Some));
    }
}
