use parking_lot::Mutex;

use super::{persistable, upsert, ChatStore, StoredEndpoint};
use crate::error::ChatError;
use crate::state::Chat;

#[derive(Debug, Default)]
struct Inner {
    chats: Vec<Chat>,
    current_chat_id: Option<String>,
    last_model: Option<String>,
    endpoint: Option<StoredEndpoint>,
    writes: usize,
}

/// Ephemeral in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chat writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }
}

impl ChatStore for MemoryStore {
    fn load_chat_list(&self) -> Result<Vec<Chat>, ChatError> {
        Ok(self.inner.lock().chats.clone())
    }

    fn save_chat_list(&self, chats: &[Chat]) -> Result<(), ChatError> {
        let mut inner = self.inner.lock();
        inner.chats = persistable(chats);
        inner.writes += 1;
        Ok(())
    }

    fn append_chat(&self, chat: &Chat) -> Result<(), ChatError> {
        if chat.messages.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        upsert(&mut inner.chats, chat);
        inner.writes += 1;
        Ok(())
    }

    fn load_current_chat_id(&self) -> Result<Option<String>, ChatError> {
        Ok(self.inner.lock().current_chat_id.clone())
    }

    fn save_current_chat_id(&self, id: &str) -> Result<(), ChatError> {
        self.inner.lock().current_chat_id = Some(id.to_string());
        Ok(())
    }

    fn load_last_model(&self) -> Result<Option<String>, ChatError> {
        Ok(self.inner.lock().last_model.clone())
    }

    fn save_last_model(&self, model: &str) -> Result<(), ChatError> {
        self.inner.lock().last_model = Some(model.to_string());
        Ok(())
    }

    fn load_endpoint_config(&self) -> Result<Option<StoredEndpoint>, ChatError> {
        Ok(self.inner.lock().endpoint.clone())
    }

    fn save_endpoint_config(&self, url: &str, api_key: &str) -> Result<(), ChatError> {
        self.inner.lock().endpoint = Some(StoredEndpoint {
            url: url.to_string(),
            api_key: api_key.to_string(),
        });
        Ok(())
    }
}
