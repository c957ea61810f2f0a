pub mod openai_chat;

pub use openai_chat::stream::{
    ChunkChoice, ChunkDelta, CompletionChunk, FunctionFragment, ToolCallFragment,
    TOOL_RES_MESSAGES_OBJECT,
};
pub use openai_chat::{
    CompletionRequest, CompletionResponse, FunctionCall, Message, ResponseChoice, Role,
    ToolCallInvocation, ToolDefinition, ToolFunction, Usage,
};
