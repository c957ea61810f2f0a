//! Read-mostly endpoint capabilities: models, tools, knowledge files and MCPL
//! servers.

mod poller;
mod upload;

pub use poller::{refresh_capabilities, spawn_capability_poller};
pub use upload::{upload_file, OngoingOperations, UploadStatus, UPLOAD_CHUNK_SIZE};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::completion::ensure_success;
use crate::error::ChatError;
use crate::protocol::ToolDefinition;
use crate::transport::{Endpoint, HttpTransport};

/// One entry of `GET /models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

impl ModelInfo {
    /// Display name, falling back to the id.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// One knowledge file known to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    /// Server-side name, used for deletion.
    pub file_name: String,
    /// Name the file was uploaded under.
    #[serde(default)]
    pub file_name_orig: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// MCPL server registration. Fields other than `name` are passed through
/// untouched so an update never drops settings this client does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McplServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelInfo>,
}

/// `/tools` answers either `{"tools": [...]}` or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum ToolList {
    Wrapped {
        #[serde(default)]
        tools: Vec<ToolDefinition>,
    },
    Bare(Vec<ToolDefinition>),
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileItem>,
}

#[derive(Serialize)]
struct FileDeleteRequest<'a> {
    file_name: &'a str,
}

#[derive(Serialize, Deserialize)]
struct McplServerList {
    #[serde(default)]
    servers: Vec<McplServerConfig>,
}

/// Fetchers for everything next to `/chat/completions`.
///
/// Each call fails independently with [`ChatError::CapabilityFetch`].
#[derive(Clone)]
pub struct CapabilityClient {
    transport: Arc<HttpTransport>,
    endpoint: Arc<Endpoint>,
}

impl CapabilityClient {
    #[must_use]
    pub fn new(transport: Arc<HttpTransport>, endpoint: Arc<Endpoint>) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub(crate) fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// `GET /models`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::CapabilityFetch`] on transport failure, non-2xx
    /// status or an unreadable body.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ChatError> {
        let list: ModelList = self.get_json("models").await?;
        Ok(list.data)
    }

    /// `GET /models/{id}`.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn retrieve_model(&self, model_id: &str) -> Result<ModelInfo, ChatError> {
        let path = format!("models/{}", urlencoding::encode(model_id));
        self.get_json(&path).await
    }

    /// `GET /tools`.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ChatError> {
        let list: ToolList = self.get_json("tools").await?;
        Ok(match list {
            ToolList::Wrapped { tools } | ToolList::Bare(tools) => tools,
        })
    }

    /// `GET /files/list`.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn list_files(&self) -> Result<Vec<FileItem>, ChatError> {
        let list: FileList = self.get_json("files/list").await?;
        Ok(list.files)
    }

    /// `POST /files/delete` with `{"file_name": ...}`.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn delete_file(&self, file_name: &str) -> Result<(), ChatError> {
        let path = "files/delete";
        let body = encode_body(path, &FileDeleteRequest { file_name })?;
        self.post(path, body).await.map(|_| ())
    }

    /// `GET /mcpl-servers-list`.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn list_mcpl_servers(&self) -> Result<Vec<McplServerConfig>, ChatError> {
        let list: McplServerList = self.get_json("mcpl-servers-list").await?;
        Ok(list.servers)
    }

    /// `POST /mcpl-servers-update` with `{"servers": [...]}`; returns the
    /// list the endpoint reports back.
    ///
    /// # Errors
    ///
    /// See [`CapabilityClient::list_models`].
    pub async fn update_mcpl_servers(
        &self,
        servers: Vec<McplServerConfig>,
    ) -> Result<Vec<McplServerConfig>, ChatError> {
        let path = "mcpl-servers-update";
        let body = encode_body(path, &McplServerList { servers })?;
        let bytes = self.post(path, body).await?;
        let list: McplServerList = decode_body(path, &bytes)?;
        Ok(list.servers)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChatError> {
        let url = self.endpoint.url(path);
        debug!(url = %url, "fetching capability");
        let response = self
            .transport
            .send(http::Method::GET, &url, self.endpoint.auth_headers(), None)
            .await
            .map_err(|err| fetch_error(path, &err))?;
        let response = ensure_success(response)
            .await
            .map_err(|err| fetch_error(path, &err))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| fetch_error(path, &ChatError::from(err)))?;
        decode_body(path, &bytes)
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<bytes::Bytes, ChatError> {
        let url = self.endpoint.url(path);
        debug!(url = %url, "posting capability update");
        let response = self
            .transport
            .send(
                http::Method::POST,
                &url,
                self.endpoint.json_headers(),
                Some(reqwest::Body::from(body)),
            )
            .await
            .map_err(|err| fetch_error(path, &err))?;
        let response = ensure_success(response)
            .await
            .map_err(|err| fetch_error(path, &err))?;
        response
            .bytes()
            .await
            .map_err(|err| fetch_error(path, &ChatError::from(err)))
    }
}

fn encode_body<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>, ChatError> {
    serde_json::to_vec(value).map_err(|err| ChatError::CapabilityFetch {
        endpoint: format!("/{path}"),
        message: format!("failed to encode request: {err}"),
    })
}

fn decode_body<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice(bytes).map_err(|err| ChatError::CapabilityFetch {
        endpoint: format!("/{path}"),
        message: format!("invalid response body: {err}"),
    })
}

pub(crate) fn fetch_error(path: &str, err: &ChatError) -> ChatError {
    let message = match err {
        ChatError::Request { status, message } => format!("status {status}: {message}"),
        ChatError::Transport(message) => message.clone(),
        other => other.to_string(),
    };
    ChatError::CapabilityFetch {
        endpoint: format!("/{}", path.trim_start_matches('/')),
        message,
    }
}
