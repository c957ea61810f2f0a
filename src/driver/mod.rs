//! Conversation driver: runs one user turn against the completion endpoint,
//! applying streamed events to the chat and re-submitting while the model asks
//! for tools.

mod title;

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::completion::CompletionsClient;
use crate::config::AppConfig;
use crate::error::{ChatError, ErrorCategory};
use crate::observability::token_counter::{
    estimate_request_tokens, estimate_tokens, log_request_usage, merge_usage,
};
use crate::observability::{log_turn_complete, TurnStats};
use crate::protocol::{CompletionRequest, Message};
use crate::state::{DriverPhase, SessionState, SessionUpdate};
use crate::stream::SemanticEvent;

/// Knobs taken from `chat` and `features` config.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_tokens: u64,
    pub max_tool_rounds: usize,
    pub title_min_messages: usize,
    pub title_max_tokens: u64,
    pub enable_tools: bool,
    pub auto_title: bool,
}

impl DriverConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_tokens: config.chat.max_tokens,
            max_tool_rounds: config.chat.max_tool_rounds,
            title_min_messages: config.chat.title_min_messages,
            title_max_tokens: config.chat.title_max_tokens,
            enable_tools: config.features.enable_tools,
            auto_title: config.features.auto_title,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed,
    /// Stopped by the user; content received so far stays in the chat.
    Cancelled,
    /// The error was also appended to the chat as an assistant message.
    Failed(ChatError),
}

/// The assistant message being streamed. It enters the chat on its first
/// non-empty change and is rewritten in place after that.
#[derive(Debug)]
struct PendingAssistant {
    index: Option<usize>,
    message: Message,
}

impl PendingAssistant {
    fn new() -> Self {
        Self {
            index: None,
            message: Message::assistant(""),
        }
    }
}

/// Unregisters the chat's stream when the turn ends, however it ends.
struct StreamGuard<'a> {
    state: &'a SessionState,
    chat_id: &'a str,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.state.end_stream(self.chat_id);
    }
}

#[derive(Clone)]
pub struct ConversationDriver {
    state: Arc<SessionState>,
    client: CompletionsClient,
    config: Arc<DriverConfig>,
}

impl ConversationDriver {
    #[must_use]
    pub fn new(state: Arc<SessionState>, client: CompletionsClient, config: DriverConfig) -> Self {
        Self {
            state,
            client,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    #[must_use]
    pub fn phase(&self, chat_id: &str) -> DriverPhase {
        self.state.phase(chat_id)
    }

    /// Stop the stream running for `chat_id`. Returns `false` when none is.
    pub fn stop(&self, chat_id: &str) -> bool {
        let stopped = self.state.stop(chat_id);
        if stopped {
            debug!(chat_id = chat_id, "stop requested");
        }
        stopped
    }

    /// Send `text` as a user message to `chat_id` and run the turn to the end,
    /// including any tool-loop rounds.
    ///
    /// Failures after the turn started are reported as
    /// [`TurnOutcome::Failed`] and recorded in the chat.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Busy`] when a response is already streaming for
    /// the chat and [`ChatError::UnknownChat`] when it does not exist.
    pub async fn send(&self, chat_id: &str, text: &str) -> Result<TurnOutcome, ChatError> {
        let cancel = self.state.begin_stream(chat_id)?;
        let guard = StreamGuard {
            state: &self.state,
            chat_id,
        };

        let model = self.state.model();
        let started = Instant::now();
        let mut stats = TurnStats::default();
        let result = self
            .run_turn(chat_id, &model, text, &cancel, &mut stats)
            .await;
        drop(guard);
        log_turn_complete(chat_id, &model, &stats, started);

        let outcome = match result {
            Ok(()) => {
                self.state.set_phase(chat_id, DriverPhase::Idle);
                self.maybe_spawn_title(chat_id);
                TurnOutcome::Completed
            }
            Err(err) if err.is_abort() => {
                debug!(chat_id = chat_id, "turn cancelled");
                self.state.set_phase(chat_id, DriverPhase::Idle);
                TurnOutcome::Cancelled
            }
            Err(err) => {
                self.state.set_phase(chat_id, DriverPhase::Error);
                match err.category() {
                    ErrorCategory::Client | ErrorCategory::Cancelled => {
                        warn!(chat_id = chat_id, error = %err, "turn failed");
                    }
                    ErrorCategory::Upstream | ErrorCategory::Local => {
                        error!(chat_id = chat_id, error = %err, "turn failed");
                    }
                }
                if let Err(persist_err) = self
                    .state
                    .push_message(chat_id, Message::assistant(err.user_message()))
                {
                    warn!(chat_id = chat_id, error = %persist_err, "failed to record error message");
                }
                self.state.set_phase(chat_id, DriverPhase::Idle);
                TurnOutcome::Failed(err)
            }
        };
        Ok(outcome)
    }

    async fn run_turn(
        &self,
        chat_id: &str,
        model: &str,
        text: &str,
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<(), ChatError> {
        self.state.set_model(model)?;
        self.state.push_message(chat_id, Message::user(text))?;

        let mut tool_rounds = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Aborted);
            }
            self.stream_round(chat_id, model, cancel, stats).await?;

            let ends_on_tool_calls = self
                .state
                .chat(chat_id)
                .and_then(|chat| chat.messages.last().map(Message::has_tool_calls))
                .unwrap_or(false);
            if !ends_on_tool_calls {
                return Ok(());
            }
            if tool_rounds >= self.config.max_tool_rounds {
                return Err(ChatError::ToolLoopExceeded {
                    rounds: tool_rounds,
                });
            }
            tool_rounds += 1;
            self.state.set_phase(chat_id, DriverPhase::ToolLoopPending);
            info!(chat_id = chat_id, round = tool_rounds, "re-submitting after tool calls");
        }
    }

    /// One streamed completion over the chat's current history.
    async fn stream_round(
        &self,
        chat_id: &str,
        model: &str,
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<(), ChatError> {
        self.state.set_phase(chat_id, DriverPhase::Streaming);
        let request = self.build_request(chat_id, model)?;
        stats.record_request(&request);

        let mut events = self.client.stream(request, cancel.clone()).await?;
        let mut pending = PendingAssistant::new();
        while let Some(event) = events.next().await {
            let event = event?;
            debug!(chat_id = chat_id, kind = event.kind(), "applying event");
            match event {
                SemanticEvent::ContentDelta(text) => {
                    stats.record_content(&text, model);
                    self.apply_pending(chat_id, &mut pending, |message| {
                        message.content.push_str(&text);
                    })?;
                    if !text.is_empty() {
                        self.state.publish(SessionUpdate::ContentDelta {
                            chat_id: chat_id.to_string(),
                            text,
                        });
                    }
                }
                SemanticEvent::ToolCall(call) => {
                    stats.tool_calls += 1;
                    info!(chat_id = chat_id, tool = %call.function.name, id = %call.id, "tool call");
                    self.apply_pending(chat_id, &mut pending, |message| {
                        message.tool_calls.get_or_insert_with(Vec::new).push(call);
                    })?;
                }
                SemanticEvent::ToolResMessages(messages) => {
                    stats.tool_results += messages.len();
                    self.state.extend_messages(chat_id, messages)?;
                    // Later content answers the tool results in a new message.
                    pending = PendingAssistant::new();
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ChatError::Aborted);
        }
        Ok(())
    }

    fn build_request(&self, chat_id: &str, model: &str) -> Result<CompletionRequest, ChatError> {
        let chat = self
            .state
            .chat(chat_id)
            .ok_or_else(|| ChatError::UnknownChat(chat_id.to_string()))?;
        let tools = if self.config.enable_tools {
            self.state.capabilities().tools()
        } else {
            Vec::new()
        };
        Ok(CompletionRequest {
            model: model.to_string(),
            messages: chat.messages,
            max_tokens: Some(self.config.max_tokens),
            stream: true,
            tools,
        })
    }

    /// Edit the pending assistant message and persist it.
    fn apply_pending(
        &self,
        chat_id: &str,
        pending: &mut PendingAssistant,
        edit: impl FnOnce(&mut Message),
    ) -> Result<(), ChatError> {
        edit(&mut pending.message);
        match pending.index {
            Some(index) => self
                .state
                .replace_message(chat_id, index, pending.message.clone()),
            None if pending.message.is_empty_assistant() => Ok(()),
            None => {
                let index = self.state.push_message(chat_id, pending.message.clone())?;
                pending.index = Some(index);
                Ok(())
            }
        }
    }

    // --- titles ---

    fn maybe_spawn_title(&self, chat_id: &str) {
        if !self.config.auto_title || !self.needs_title(chat_id) {
            return;
        }
        let driver = self.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = driver.generate_title(&chat_id).await {
                warn!(chat_id = %chat_id, error = %err, "title generation failed");
            }
        });
    }

    fn needs_title(&self, chat_id: &str) -> bool {
        self.state.chat(chat_id).is_some_and(|chat| {
            chat.name.is_empty() && chat.messages.len() >= self.config.title_min_messages
        })
    }

    /// Ask the model for a short chat name and store it.
    ///
    /// Returns the new name, or `None` when the chat already has one, is too
    /// short, another title request is running, or the reply was empty.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`] for a missing chat, completion
    /// errors from the title request and [`ChatError::Persistence`] when the
    /// name cannot be saved.
    pub async fn generate_title(&self, chat_id: &str) -> Result<Option<String>, ChatError> {
        let chat = self
            .state
            .chat(chat_id)
            .ok_or_else(|| ChatError::UnknownChat(chat_id.to_string()))?;
        if !self.needs_title(chat_id) {
            return Ok(None);
        }
        if !self.state.try_begin_title(chat_id) {
            debug!(chat_id = chat_id, "title request already in flight");
            return Ok(None);
        }

        let model = self.state.model();
        let request = title::build_title_request(&chat, &model, self.config.title_max_tokens);
        let estimated_input = estimate_request_tokens(&request);
        let started = Instant::now();
        let result = self.client.complete(request, None).await;
        self.state.finish_title(chat_id);
        let response = result?;

        let title = title::clean_title(response.first_content().unwrap_or(""));
        let usage = merge_usage(
            response.usage.as_ref(),
            estimated_input,
            estimate_tokens(&title, &model),
        );
        log_request_usage(&model, "title", &usage, started.elapsed());
        if title.is_empty() {
            return Ok(None);
        }
        if self.state.set_chat_name(chat_id, &title)? {
            info!(chat_id = chat_id, title = %title, "chat titled");
            Ok(Some(title))
        } else {
            Ok(None)
        }
    }
}
