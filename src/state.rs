mod capability_cache;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use capability_cache::CapabilityCache;

use crate::error::ChatError;
use crate::protocol::Message;
use crate::store::ChatStore;
use crate::util::generate_chat_id;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// One conversation. `id` never changes; `name` stays empty until titled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Chat {
    /// Empty chat with a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(generate_chat_id())
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            messages: Vec::new(),
        }
    }

    /// A chat without messages is a draft and is never persisted.
    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.messages.is_empty()
    }

    /// Name for listings: the title, or the id while untitled.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl Default for Chat {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the conversation driver stands for one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Idle,
    /// Draft chat waiting for its first message.
    AwaitingUserSend,
    Streaming,
    /// A turn ended on tool calls and is about to be re-submitted.
    ToolLoopPending,
    /// A turn failed; the error message is being recorded.
    Error,
}

impl DriverPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DriverPhase::Idle => "idle",
            DriverPhase::AwaitingUserSend => "awaiting_user_send",
            DriverPhase::Streaming => "streaming",
            DriverPhase::ToolLoopPending => "tool_loop_pending",
            DriverPhase::Error => "error",
        }
    }
}

/// Change notifications for renderers.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Text appended to the in-progress assistant message.
    ContentDelta { chat_id: String, text: String },
    /// Snapshot taken right after a persisted change.
    ChatSaved(Arc<Chat>),
    Phase { chat_id: String, phase: DriverPhase },
    Titled { chat_id: String, name: String },
    CurrentChat { chat_id: String },
}

/// Shared session state: chats, current selection, model, active streams and
/// title flags, backed by a [`ChatStore`].
///
/// The `chats` lock is held only for in-memory edits. Chat commits are
/// serialized by `persist`, so snapshots reach the store and subscribers in
/// the order the edits were made.
pub struct SessionState {
    store: Arc<dyn ChatStore>,
    chats: RwLock<Vec<Chat>>,
    persist: Mutex<()>,
    current_chat_id: RwLock<String>,
    model: RwLock<String>,
    streams: Mutex<FxHashMap<String, CancellationToken>>,
    phases: Mutex<FxHashMap<String, DriverPhase>>,
    titles_in_flight: Mutex<FxHashSet<String>>,
    capabilities: Arc<CapabilityCache>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionState {
    /// Restore chats, the current chat and the last model from `store`.
    ///
    /// When no stored current chat exists a fresh draft becomes current.
    /// `default_model` is used when no model was saved.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the store cannot be read.
    pub fn load(
        store: Arc<dyn ChatStore>,
        default_model: &str,
        capability_poll_interval_secs: u64,
    ) -> Result<Self, ChatError> {
        let mut chats = store.load_chat_list()?;
        let stored_current = store.load_current_chat_id()?;
        let current = match stored_current {
            Some(id) if chats.iter().any(|chat| chat.id == id) => id,
            _ => {
                let draft = Chat::new();
                let id = draft.id.clone();
                chats.push(draft);
                id
            }
        };
        let model = store
            .load_last_model()?
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| default_model.to_string());
        info!(
            chats = chats.len(),
            current = %current,
            model = %model,
            "session restored"
        );

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            chats: RwLock::new(chats),
            persist: Mutex::new(()),
            current_chat_id: RwLock::new(current),
            model: RwLock::new(model),
            streams: Mutex::new(FxHashMap::default()),
            phases: Mutex::new(FxHashMap::default()),
            titles_in_flight: Mutex::new(FxHashSet::default()),
            capabilities: Arc::new(CapabilityCache::new(capability_poll_interval_secs)),
            updates,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    #[must_use]
    pub fn capabilities(&self) -> &Arc<CapabilityCache> {
        &self.capabilities
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    // --- chats ---

    #[must_use]
    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.chats
            .read()
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned()
    }

    #[must_use]
    pub fn chats(&self) -> Vec<Chat> {
        self.chats.read().clone()
    }

    #[must_use]
    pub fn current_chat_id(&self) -> String {
        self.current_chat_id.read().clone()
    }

    #[must_use]
    pub fn current_chat(&self) -> Option<Chat> {
        self.chat(&self.current_chat_id())
    }

    /// Make `chat_id` current. Streams running for other chats continue.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`] when no such chat exists and
    /// [`ChatError::Persistence`] when the selection cannot be saved.
    pub fn switch_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        if !self.chats.read().iter().any(|chat| chat.id == chat_id) {
            return Err(ChatError::UnknownChat(chat_id.to_string()));
        }
        chat_id.clone_into(&mut self.current_chat_id.write());
        self.store.save_current_chat_id(chat_id)?;
        debug!(chat_id = chat_id, "switched chat");
        self.publish(SessionUpdate::CurrentChat {
            chat_id: chat_id.to_string(),
        });
        Ok(())
    }

    /// Create a draft chat and make it current, unless the current chat is
    /// already an empty draft, in which case its id is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the selection cannot be saved.
    pub fn new_chat(&self) -> Result<String, ChatError> {
        let current = self.current_chat_id();
        if self.chat(&current).is_some_and(|chat| chat.is_draft()) {
            debug!(chat_id = %current, "current chat is already empty");
            return Ok(current);
        }
        let chat = Chat::new();
        let id = chat.id.clone();
        self.chats.write().push(chat);
        self.switch_chat(&id)?;
        Ok(id)
    }

    // --- messages ---

    /// Apply `edit` to the chat, persist the result and publish a snapshot.
    fn commit<R>(
        &self,
        chat_id: &str,
        edit: impl FnOnce(&mut Chat) -> R,
    ) -> Result<R, ChatError> {
        let _persist = self.persist.lock();
        let (result, snapshot) = {
            let mut chats = self.chats.write();
            let chat = chats
                .iter_mut()
                .find(|chat| chat.id == chat_id)
                .ok_or_else(|| ChatError::UnknownChat(chat_id.to_string()))?;
            let result = edit(chat);
            (result, chat.clone())
        };
        self.store.append_chat(&snapshot)?;
        self.publish(SessionUpdate::ChatSaved(Arc::new(snapshot)));
        Ok(result)
    }

    /// Append a message and return its index.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`] or [`ChatError::Persistence`].
    pub fn push_message(&self, chat_id: &str, message: Message) -> Result<usize, ChatError> {
        self.commit(chat_id, |chat| {
            chat.messages.push(message);
            chat.messages.len() - 1
        })
    }

    /// Append several messages at once.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`] or [`ChatError::Persistence`].
    pub fn extend_messages(&self, chat_id: &str, messages: Vec<Message>) -> Result<(), ChatError> {
        self.commit(chat_id, |chat| chat.messages.extend(messages))
    }

    /// Overwrite the message at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`], [`ChatError::Internal`] when
    /// `index` is out of range, or [`ChatError::Persistence`].
    pub fn replace_message(
        &self,
        chat_id: &str,
        index: usize,
        message: Message,
    ) -> Result<(), ChatError> {
        self.commit(chat_id, |chat| match chat.messages.get_mut(index) {
            Some(slot) => {
                *slot = message;
                Ok(())
            }
            None => Err(ChatError::Internal(format!(
                "message {index} out of range for chat '{}'",
                chat.id
            ))),
        })?
    }

    /// Set the chat name if it is still empty. Returns whether it was set.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownChat`] or [`ChatError::Persistence`].
    pub fn set_chat_name(&self, chat_id: &str, name: &str) -> Result<bool, ChatError> {
        let named = self.commit(chat_id, |chat| {
            if chat.name.is_empty() {
                name.clone_into(&mut chat.name);
                true
            } else {
                false
            }
        })?;
        if named {
            self.publish(SessionUpdate::Titled {
                chat_id: chat_id.to_string(),
                name: name.to_string(),
            });
        }
        Ok(named)
    }

    // --- model ---

    #[must_use]
    pub fn model(&self) -> String {
        self.model.read().clone()
    }

    /// Select and remember the model used for the next requests.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when it cannot be saved.
    pub fn set_model(&self, model: &str) -> Result<(), ChatError> {
        model.clone_into(&mut self.model.write());
        self.store.save_last_model(model)
    }

    // --- streams ---

    /// Register the stream for `chat_id` and hand out its stop token.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Busy`] when a stream is already running for the
    /// chat and [`ChatError::UnknownChat`] when the chat does not exist.
    pub fn begin_stream(&self, chat_id: &str) -> Result<CancellationToken, ChatError> {
        if self.chat(chat_id).is_none() {
            return Err(ChatError::UnknownChat(chat_id.to_string()));
        }
        let mut streams = self.streams.lock();
        if streams.contains_key(chat_id) {
            return Err(ChatError::Busy(chat_id.to_string()));
        }
        let token = CancellationToken::new();
        streams.insert(chat_id.to_string(), token.clone());
        Ok(token)
    }

    pub fn end_stream(&self, chat_id: &str) {
        self.streams.lock().remove(chat_id);
    }

    #[must_use]
    pub fn is_streaming(&self, chat_id: &str) -> bool {
        self.streams.lock().contains_key(chat_id)
    }

    /// Cancel the stream running for `chat_id`. Returns `false` when none is.
    pub fn stop(&self, chat_id: &str) -> bool {
        match self.streams.lock().get(chat_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // --- phases ---

    #[must_use]
    pub fn phase(&self, chat_id: &str) -> DriverPhase {
        let phase = self
            .phases
            .lock()
            .get(chat_id)
            .copied()
            .unwrap_or(DriverPhase::Idle);
        if phase == DriverPhase::Idle && self.chat(chat_id).is_some_and(|chat| chat.is_draft()) {
            return DriverPhase::AwaitingUserSend;
        }
        phase
    }

    pub fn set_phase(&self, chat_id: &str, phase: DriverPhase) {
        let previous = self.phases.lock().insert(chat_id.to_string(), phase);
        if previous != Some(phase) {
            debug!(chat_id = chat_id, phase = phase.as_str(), "driver phase");
            self.publish(SessionUpdate::Phase {
                chat_id: chat_id.to_string(),
                phase,
            });
        }
    }

    // --- titles ---

    /// Claim the title request for `chat_id`; `false` if one is in flight.
    #[must_use]
    pub fn try_begin_title(&self, chat_id: &str) -> bool {
        self.titles_in_flight.lock().insert(chat_id.to_string())
    }

    pub fn finish_title(&self, chat_id: &str) {
        self.titles_in_flight.lock().remove(chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredEndpoint};

    fn state_with(store: Arc<MemoryStore>) -> SessionState {
        SessionState::load(store, "gpt-4o-mini", 30).expect("load")
    }

    #[test]
    fn test_load_creates_draft_when_nothing_stored() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let current = state.current_chat().expect("current");
        assert!(current.is_draft());
        assert_eq!(current.id.len(), 9);
        assert_eq!(state.model(), "gpt-4o-mini");
        assert_eq!(state.phase(&current.id), DriverPhase::AwaitingUserSend);
    }

    #[test]
    fn test_load_restores_current_and_model() {
        let store = Arc::new(MemoryStore::new());
        let mut chat = Chat::with_id("abc");
        chat.messages.push(Message::user("hi"));
        store.append_chat(&chat).expect("append");
        store.save_current_chat_id("abc").expect("save");
        store.save_last_model("llama3").expect("save");

        let state = state_with(store);
        assert_eq!(state.current_chat_id(), "abc");
        assert_eq!(state.model(), "llama3");
        assert_eq!(state.chats().len(), 1);
    }

    #[test]
    fn test_new_chat_reuses_empty_draft() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let draft = state.current_chat_id();
        assert_eq!(state.new_chat().expect("new"), draft);

        state.push_message(&draft, Message::user("hi")).expect("push");
        let next = state.new_chat().expect("new");
        assert_ne!(next, draft);
        assert_eq!(state.current_chat_id(), next);
    }

    #[test]
    fn test_switch_unknown_chat_fails() {
        let state = state_with(Arc::new(MemoryStore::new()));
        assert!(matches!(
            state.switch_chat("missing"),
            Err(ChatError::UnknownChat(_))
        ));
    }

    #[test]
    fn test_every_message_edit_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());
        let id = state.current_chat_id();
        let index = state.push_message(&id, Message::user("q")).expect("push");
        assert_eq!(index, 0);
        let index = state
            .push_message(&id, Message::assistant("a"))
            .expect("push");
        state
            .replace_message(&id, index, Message::assistant("ab"))
            .expect("replace");
        assert_eq!(store.write_count(), 3);
        let stored = store.load_chat_list().expect("load");
        assert_eq!(stored[0].messages[1].content, "ab");
        assert!(state.replace_message(&id, 9, Message::assistant("x")).is_err());
    }

    #[test]
    fn test_name_is_never_overwritten() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let id = state.current_chat_id();
        state.push_message(&id, Message::user("q")).expect("push");
        assert!(state.set_chat_name(&id, "First").expect("name"));
        assert!(!state.set_chat_name(&id, "Second").expect("name"));
        assert_eq!(state.chat(&id).expect("chat").name, "First");
    }

    #[test]
    fn test_one_stream_per_chat() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let id = state.current_chat_id();
        let token = state.begin_stream(&id).expect("begin");
        assert!(matches!(state.begin_stream(&id), Err(ChatError::Busy(_))));
        assert!(state.stop(&id));
        assert!(token.is_cancelled());
        state.end_stream(&id);
        assert!(!state.stop(&id));
        assert!(state.begin_stream(&id).is_ok());
    }

    #[test]
    fn test_title_flag_is_exclusive() {
        let state = state_with(Arc::new(MemoryStore::new()));
        assert!(state.try_begin_title("a"));
        assert!(!state.try_begin_title("a"));
        state.finish_title("a");
        assert!(state.try_begin_title("a"));
    }

    /// Holds up the write of the first titled snapshot.
    struct SlowTitleStore {
        inner: MemoryStore,
    }

    impl ChatStore for SlowTitleStore {
        fn load_chat_list(&self) -> Result<Vec<Chat>, ChatError> {
            self.inner.load_chat_list()
        }
        fn save_chat_list(&self, chats: &[Chat]) -> Result<(), ChatError> {
            self.inner.save_chat_list(chats)
        }
        fn append_chat(&self, chat: &Chat) -> Result<(), ChatError> {
            if !chat.name.is_empty() && chat.messages.len() == 1 {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.append_chat(chat)
        }
        fn load_current_chat_id(&self) -> Result<Option<String>, ChatError> {
            self.inner.load_current_chat_id()
        }
        fn save_current_chat_id(&self, id: &str) -> Result<(), ChatError> {
            self.inner.save_current_chat_id(id)
        }
        fn load_last_model(&self) -> Result<Option<String>, ChatError> {
            self.inner.load_last_model()
        }
        fn save_last_model(&self, model: &str) -> Result<(), ChatError> {
            self.inner.save_last_model(model)
        }
        fn load_endpoint_config(&self) -> Result<Option<StoredEndpoint>, ChatError> {
            self.inner.load_endpoint_config()
        }
        fn save_endpoint_config(&self, url: &str, api_key: &str) -> Result<(), ChatError> {
            self.inner.save_endpoint_config(url, api_key)
        }
    }

    #[test]
    fn test_concurrent_commits_persist_in_edit_order() {
        let store = Arc::new(SlowTitleStore {
            inner: MemoryStore::new(),
        });
        let state = SessionState::load(store.clone(), "gpt-4o-mini", 30).expect("load");
        let id = state.current_chat_id();
        state.push_message(&id, Message::user("plan a trip")).expect("push");

        std::thread::scope(|scope| {
            scope.spawn(|| {
                state.set_chat_name(&id, "Trip Planning").expect("name");
            });
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(50));
                state
                    .push_message(&id, Message::assistant("Sure"))
                    .expect("push");
            });
        });

        let in_memory = state.chat(&id).expect("chat");
        let stored = store.load_chat_list().expect("load");
        assert_eq!(in_memory.messages.len(), 2);
        assert_eq!(stored[0].messages.len(), 2);
        assert_eq!(stored[0].name, "Trip Planning");
    }

    #[tokio::test]
    async fn test_updates_carry_snapshots() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let mut updates = state.subscribe();
        let id = state.current_chat_id();
        state.push_message(&id, Message::user("q")).expect("push");
        match updates.recv().await.expect("update") {
            SessionUpdate::ChatSaved(chat) => {
                assert_eq!(chat.id, id);
                assert_eq!(chat.messages.len(), 1);
            }
            other => panic!("unexpected update {other:?}"),
        }
    }
}
