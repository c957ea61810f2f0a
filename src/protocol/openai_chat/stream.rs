use serde::{Deserialize, Serialize};

use super::{Message, Usage};

/// `object` value the upstream uses for a server-synthesized tool-result batch.
pub const TOOL_RES_MESSAGES_OBJECT: &str = "tool_res_messages";

/// Finish reason reported when the model hands off to tool execution.
pub const FINISH_REASON_TOOL_CALLS: &str = "tool_calls";

/// A streaming chunk. Every field is optional so that unfamiliar shapes still
/// decode and are skipped downstream instead of failing the stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<ChunkChoice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_res_messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionChunk {
    /// `true` when this chunk is a pre-packaged batch of tool-result messages.
    #[must_use]
    pub fn is_tool_res_batch(&self) -> bool {
        self.object.as_deref() == Some(TOOL_RES_MESSAGES_OBJECT) || self.tool_res_messages.is_some()
    }
}

/// A choice within a stream chunk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChunkDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ChunkChoice {
    #[must_use]
    pub fn finished_with_tool_calls(&self) -> bool {
        self.finish_reason.as_deref() == Some(FINISH_REASON_TOOL_CALLS)
    }
}

/// Delta content within a stream choice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

/// A tool call fragment in streaming.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionFragment>,
}

/// Function delta within a streaming tool call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_with_null_content_and_tool_fragment() {
        let chunk: CompletionChunk = serde_json::from_str(
            r#"{"id":"c","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":null,"tool_calls":[{"index":0,"id":"c1","type":"function","function":{"name":"search","arguments":""}}]},"finish_reason":null}]}"#,
        )
        .expect("chunk");
        let choices = chunk.choices.expect("choices");
        let delta = choices[0].delta.as_ref().expect("delta");
        assert!(delta.content.is_none());
        let fragment = &delta.tool_calls.as_ref().expect("tool calls")[0];
        assert_eq!(fragment.index, Some(0));
        assert_eq!(fragment.type_.as_deref(), Some("function"));
        assert!(!choices[0].finished_with_tool_calls());
    }

    #[test]
    fn test_tool_res_batch_detection() {
        let by_field: CompletionChunk = serde_json::from_str(
            r#"{"tool_res_messages":[{"role":"tool","content":"42","tool_call_id":"c1"}]}"#,
        )
        .expect("chunk");
        assert!(by_field.is_tool_res_batch());

        let by_object: CompletionChunk =
            serde_json::from_str(r#"{"object":"tool_res_messages"}"#).expect("chunk");
        assert!(by_object.is_tool_res_batch());

        let plain: CompletionChunk =
            serde_json::from_str(r#"{"object":"chat.completion.chunk","choices":[]}"#)
                .expect("chunk");
        assert!(!plain.is_tool_res_batch());
    }

    #[test]
    fn test_unknown_shape_decodes_to_empty_chunk() {
        let chunk: CompletionChunk =
            serde_json::from_str(r#"{"something":"else"}"#).expect("chunk");
        assert_eq!(chunk, CompletionChunk::default());
    }
}
