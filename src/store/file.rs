use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{persistable, upsert, ChatStore, StoredEndpoint};
use crate::error::ChatError;
use crate::state::Chat;

const CHATS_KEY: &str = "chats";
const CURRENT_CHAT_KEY: &str = "current_chat_id";
const LAST_MODEL_KEY: &str = "last_model";
const ENDPOINT_KEY: &str = "endpoint";

/// Stores each key as one compact JSON document in a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous document intact. The chat list is read from
/// disk once and then kept in memory, so an append costs one write.
pub struct FileStore {
    dir: PathBuf,
    // Loaded lazily; also serializes writes of the chat list.
    chats: Mutex<Option<Vec<Chat>>>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] when the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self, ChatError> {
        std::fs::create_dir_all(dir).map_err(|err| {
            ChatError::Persistence(format!(
                "failed to create storage dir {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            chats: Mutex::new(None),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read a document; a missing or corrupt file reads as absent.
    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ChatError> {
        let path = self.key_path(key);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ChatError::Persistence(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "ignoring corrupt storage file");
                Ok(None)
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ChatError> {
        let path = self.key_path(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        let json = serde_json::to_vec(value).map_err(|err| {
            ChatError::Persistence(format!("failed to serialize {key}: {err}"))
        })?;
        std::fs::write(&tmp, json).map_err(|err| {
            ChatError::Persistence(format!("failed to write {}: {err}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &path).map_err(|err| {
            ChatError::Persistence(format!("failed to replace {}: {err}", path.display()))
        })?;
        debug!(key = key, path = %path.display(), "stored document");
        Ok(())
    }
}

impl ChatStore for FileStore {
    fn load_chat_list(&self) -> Result<Vec<Chat>, ChatError> {
        let mut cached = self.chats.lock();
        if let Some(chats) = cached.as_ref() {
            return Ok(chats.clone());
        }
        let chats = self.read::<Vec<Chat>>(CHATS_KEY)?.unwrap_or_default();
        *cached = Some(chats.clone());
        Ok(chats)
    }

    fn save_chat_list(&self, chats: &[Chat]) -> Result<(), ChatError> {
        let mut cached = self.chats.lock();
        let chats = persistable(chats);
        self.write(CHATS_KEY, &chats)?;
        *cached = Some(chats);
        Ok(())
    }

    fn append_chat(&self, chat: &Chat) -> Result<(), ChatError> {
        if chat.messages.is_empty() {
            return Ok(());
        }
        let mut cached = self.chats.lock();
        let mut chats = match cached.take() {
            Some(chats) => chats,
            None => self.read::<Vec<Chat>>(CHATS_KEY)?.unwrap_or_default(),
        };
        upsert(&mut chats, chat);
        let written = self.write(CHATS_KEY, &chats);
        *cached = Some(chats);
        written
    }

    fn load_current_chat_id(&self) -> Result<Option<String>, ChatError> {
        self.read(CURRENT_CHAT_KEY)
    }

    fn save_current_chat_id(&self, id: &str) -> Result<(), ChatError> {
        self.write(CURRENT_CHAT_KEY, id)
    }

    fn load_last_model(&self) -> Result<Option<String>, ChatError> {
        self.read(LAST_MODEL_KEY)
    }

    fn save_last_model(&self, model: &str) -> Result<(), ChatError> {
        self.write(LAST_MODEL_KEY, model)
    }

    fn load_endpoint_config(&self) -> Result<Option<StoredEndpoint>, ChatError> {
        self.read(ENDPOINT_KEY)
    }

    fn save_endpoint_config(&self, url: &str, api_key: &str) -> Result<(), ChatError> {
        self.write(
            ENDPOINT_KEY,
            &StoredEndpoint {
                url: url.to_string(),
                api_key: api_key.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn chat_with(id: &str, texts: &[&str]) -> Chat {
        let mut chat = Chat::with_id(id);
        chat.messages
            .extend(texts.iter().map(|text| Message::user(*text)));
        chat
    }

    #[test]
    fn test_chats_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.append_chat(&chat_with("a", &["hi"])).unwrap();
            store.append_chat(&chat_with("b", &["yo", "again"])).unwrap();
            store.append_chat(&Chat::with_id("draft")).unwrap();
        }
        let store = FileStore::new(dir.path()).unwrap();
        let chats = store.load_chat_list().unwrap();
        let ids: Vec<&str> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(chats[1].messages.len(), 2);
    }

    #[test]
    fn test_save_list_drops_drafts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store
            .save_chat_list(&[Chat::with_id("draft"), chat_with("kept", &["x"])])
            .unwrap();
        let chats = store.load_chat_list().unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id, "kept");
    }

    #[test]
    fn test_missing_keys_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.load_chat_list().unwrap().is_empty());
        assert_eq!(store.load_current_chat_id().unwrap(), None);
        assert_eq!(store.load_last_model().unwrap(), None);
        assert_eq!(store.load_endpoint_config().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chats.json"), "{not json").unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.load_chat_list().unwrap().is_empty());
        store.append_chat(&chat_with("fresh", &["hello"])).unwrap();
        assert_eq!(store.load_chat_list().unwrap().len(), 1);
    }

    #[test]
    fn test_append_writes_from_cached_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.append_chat(&chat_with("a", &["hi"])).unwrap();
        // Not re-read on the next append.
        std::fs::write(dir.path().join("chats.json"), "{not json").unwrap();
        store.append_chat(&chat_with("b", &["yo"])).unwrap();

        let json = std::fs::read_to_string(dir.path().join("chats.json")).unwrap();
        assert!(!json.contains('\n'));
        let reopened = FileStore::new(dir.path()).unwrap();
        let ids: Vec<String> = reopened
            .load_chat_list()
            .unwrap()
            .into_iter()
            .map(|chat| chat.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.save_current_chat_id("k3j2h1g0f").unwrap();
        store.save_last_model("llama3").unwrap();
        store
            .save_endpoint_config("https://api.example.com/v1", "sk-x")
            .unwrap();

        let reopened = FileStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened.load_current_chat_id().unwrap().as_deref(),
            Some("k3j2h1g0f")
        );
        assert_eq!(reopened.load_last_model().unwrap().as_deref(), Some("llama3"));
        assert_eq!(
            reopened.load_endpoint_config().unwrap(),
            Some(StoredEndpoint {
                url: "https://api.example.com/v1".into(),
                api_key: "sk-x".into()
            })
        );
        assert!(!dir.path().join(".last_model.json.tmp").exists());
    }
}
