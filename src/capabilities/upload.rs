use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{fetch_error, CapabilityClient};
use crate::completion::ensure_success;
use crate::error::ChatError;

/// Upload bodies are streamed in pieces of this size.
pub const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

const UPLOAD_PATH: &str = "files/upload";
const X_FILE_NAME: &str = "x-file-name";
const X_FILE_ROLE: &str = "x-file-role";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// Rounded percentage of bytes handed to the transport.
    Uploading(u8),
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: u64,
    pub file_name: String,
    pub status: UploadStatus,
}

/// Uploads started in this session and their latest status.
#[derive(Debug, Default)]
pub struct OngoingOperations {
    next_id: AtomicU64,
    items: Mutex<Vec<Operation>>,
}

impl OngoingOperations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, file_name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.items.lock().push(Operation {
            id,
            file_name: file_name.to_string(),
            status: UploadStatus::Uploading(0),
        });
        id
    }

    fn set_status(&self, id: u64, status: UploadStatus) {
        if let Some(op) = self.items.lock().iter_mut().find(|op| op.id == id) {
            op.status = status;
        }
    }

    fn remove(&self, id: u64) {
        self.items.lock().retain(|op| op.id != id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Operation> {
        self.items.lock().clone()
    }

    /// Forget every operation that is no longer uploading.
    pub fn clear_finished(&self) {
        self.items
            .lock()
            .retain(|op| matches!(op.status, UploadStatus::Uploading(_)));
    }
}

struct UploadBody {
    file: tokio::fs::File,
    sent: u64,
    total: u64,
    op_id: u64,
    operations: Arc<OngoingOperations>,
}

/// Rounded share of `sent` in `total`, in percent.
fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (sent.saturating_mul(100) + total / 2) / total;
    u8::try_from(pct.min(100)).unwrap_or(100)
}

/// Fill up to one chunk from `file`; an empty result means end of file.
async fn read_chunk(file: &mut tokio::fs::File) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(UPLOAD_CHUNK_SIZE);
    let mut filled = 0;
    while filled < UPLOAD_CHUNK_SIZE {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

fn body_stream(
    body: UploadBody,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures_util::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        match read_chunk(&mut body.file).await {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => {
                body.sent += chunk.len() as u64;
                let pct = percent(body.sent, body.total);
                body.operations
                    .set_status(body.op_id, UploadStatus::Uploading(pct));
                debug!(sent = body.sent, total = body.total, pct = pct, "upload progress");
                Some((Ok(chunk), Some(body)))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
}

fn upload_headers(
    client: &CapabilityClient,
    file_name: &str,
    file_role: &str,
) -> Result<http::HeaderMap, ChatError> {
    let mut headers = client.endpoint().auth_headers().clone();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/octet-stream"),
    );
    let encoded = urlencoding::encode(file_name);
    let name = http::HeaderValue::from_str(&encoded)
        .map_err(|err| fetch_error(UPLOAD_PATH, &ChatError::Internal(err.to_string())))?;
    let role = http::HeaderValue::from_str(file_role).map_err(|_| {
        fetch_error(
            UPLOAD_PATH,
            &ChatError::Internal(format!("invalid file role '{file_role}'")),
        )
    })?;
    headers.insert(X_FILE_NAME, name);
    headers.insert(X_FILE_ROLE, role);
    Ok(headers)
}

/// Stream the file at `path` to `POST /files/upload`, recording progress in
/// `operations`.
///
/// Cancelling `cancel` drops the request and removes the operation without
/// marking it failed.
///
/// # Errors
///
/// Returns [`ChatError::Aborted`] when cancelled and
/// [`ChatError::CapabilityFetch`] when the file cannot be read or the endpoint
/// rejects the upload.
pub async fn upload_file(
    client: &CapabilityClient,
    path: &Path,
    file_role: &str,
    operations: &Arc<OngoingOperations>,
    cancel: &CancellationToken,
) -> Result<(), ChatError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if file_name.is_empty() {
        return Err(fetch_error(
            UPLOAD_PATH,
            &ChatError::Internal(format!("{} is not a file", path.display())),
        ));
    }
    let headers = upload_headers(client, &file_name, file_role)?;
    let file = tokio::fs::File::open(path).await.map_err(|err| {
        fetch_error(
            UPLOAD_PATH,
            &ChatError::Internal(format!("failed to open {}: {err}", path.display())),
        )
    })?;
    let total = file
        .metadata()
        .await
        .map(|meta| meta.len())
        .map_err(|err| fetch_error(UPLOAD_PATH, &ChatError::Internal(err.to_string())))?;

    let op_id = operations.begin(&file_name);
    info!(file = %file_name, bytes = total, role = file_role, "starting upload");
    let body = reqwest::Body::wrap_stream(body_stream(UploadBody {
        file,
        sent: 0,
        total,
        op_id,
        operations: operations.clone(),
    }));

    let url = client.endpoint().url(UPLOAD_PATH);
    let exchange = async {
        let response = client
            .transport()
            .send(http::Method::POST, &url, &headers, Some(body))
            .await?;
        ensure_success(response).await.map(|_| ())
    };
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ChatError::Aborted),
        result = exchange => result,
    };

    match result {
        Ok(()) => {
            operations.set_status(op_id, UploadStatus::Done);
            info!(file = %file_name, "upload finished");
            Ok(())
        }
        Err(ChatError::Aborted) => {
            operations.remove(op_id);
            debug!(file = %file_name, "upload aborted");
            Err(ChatError::Aborted)
        }
        Err(err) => {
            let err = fetch_error(UPLOAD_PATH, &err);
            operations.set_status(op_id, UploadStatus::Failed(err.to_string()));
            warn!(file = %file_name, error = %err, "upload failed");
            Err(err)
        }
    }
}
