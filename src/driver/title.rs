use crate::protocol::{CompletionRequest, Message, Role};
use crate::state::Chat;

const TITLE_INSTRUCTION: &str = "Write a short title, at most six words, for the conversation above. \
Reply with the title only, without quotes or punctuation at the end.";

/// Messages longer than this are cut before being sent for titling.
const TITLE_CONTEXT_CHARS: usize = 1_000;

/// Characters stripped from both ends of a generated title.
const TITLE_TRIM: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

/// Non-streaming request asking the model to name `chat`.
pub(crate) fn build_title_request(chat: &Chat, model: &str, max_tokens: u64) -> CompletionRequest {
    let mut messages: Vec<Message> = chat
        .messages
        .iter()
        .filter(|message| matches!(message.role, Role::User | Role::Assistant))
        .filter(|message| !message.content.is_empty())
        .map(|message| Message {
            role: message.role,
            content: message.content.chars().take(TITLE_CONTEXT_CHARS).collect(),
            tool_calls: None,
            tool_call_id: None,
        })
        .collect();
    messages.push(Message::user(TITLE_INSTRUCTION));

    CompletionRequest {
        model: model.to_string(),
        messages,
        max_tokens: Some(max_tokens),
        stream: false,
        tools: Vec::new(),
    }
}

/// First line of the reply with whitespace and surrounding quotes removed.
pub(crate) fn clean_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or("");
    let mut title = line.trim();
    loop {
        let stripped = title.trim_matches(TITLE_TRIM).trim();
        if stripped == title {
            break;
        }
        title = stripped;
    }
    title.to_string()
}
