//! Key-value persistence for chats and session settings.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::state::Chat;

/// Endpoint URL and key remembered between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEndpoint {
    pub url: String,
    pub api_key: String,
}

/// Persistence backend.
///
/// Chats with zero messages are drafts and are never written: saving a list
/// drops them and appending one is a no-op.
pub trait ChatStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be read.
    fn load_chat_list(&self) -> Result<Vec<Chat>, ChatError>;

    /// Replace the stored list.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be written.
    fn save_chat_list(&self, chats: &[Chat]) -> Result<(), ChatError>;

    /// Insert `chat`, or replace the stored chat with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be written.
    fn append_chat(&self, chat: &Chat) -> Result<(), ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be read.
    fn load_current_chat_id(&self) -> Result<Option<String>, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be written.
    fn save_current_chat_id(&self, id: &str) -> Result<(), ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be read.
    fn load_last_model(&self) -> Result<Option<String>, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be written.
    fn save_last_model(&self, model: &str) -> Result<(), ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be read.
    fn load_endpoint_config(&self) -> Result<Option<StoredEndpoint>, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the backend cannot be written.
    fn save_endpoint_config(&self, url: &str, api_key: &str) -> Result<(), ChatError>;
}

/// Drop drafts from a list about to be persisted.
pub(crate) fn persistable(chats: &[Chat]) -> Vec<Chat> {
    chats
        .iter()
        .filter(|chat| !chat.messages.is_empty())
        .cloned()
        .collect()
}

/// Upsert `chat` into `chats` by id.
pub(crate) fn upsert(chats: &mut Vec<Chat>, chat: &Chat) {
    match chats.iter_mut().find(|existing| existing.id == chat.id) {
        Some(existing) => existing.clone_from(chat),
        None => chats.push(chat.clone()),
    }
}
