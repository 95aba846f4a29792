//! Object-storage accessor for patient data and chat transcripts.
//!
//! Patient documents live as JSON/text blobs under `patient_data/{id}/` in
//! a cloud bucket. `ObjectStore` is the seam the rest of the crate depends
//! on; `GcsStore` talks to the hosted bucket API and `MemoryStore` backs
//! tests and local development.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Errors from object-storage operations.
///
/// A missing object is not an error: `read` returns `Ok(None)` so callers
/// can distinguish "absent document" from "storage is down".
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(String),
    #[error("storage request timed out after {0}s")]
    Timeout(u64),
    #[error("storage responded with status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("object {0} is not valid UTF-8")]
    Encoding(String),
}

/// Read/write/list access to a blob namespace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. `Ok(None)` when the object does not exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write an object, overwriting any previous content.
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// List object paths under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Read an object as UTF-8 text.
    async fn read_string(&self, path: &str) -> Result<Option<String>, StorageError> {
        match self.read(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StorageError::Encoding(path.to_string())),
            None => Ok(None),
        }
    }

    /// Read an object and parse it as JSON. `Ok(None)` when absent;
    /// unparseable content is surfaced as an encoding error.
    async fn read_json(&self, path: &str) -> Result<Option<serde_json::Value>, StorageError> {
        match self.read_string(path).await? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|_| StorageError::Encoding(path.to_string())),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// GcsStore — hosted bucket via the storage JSON/XML API
// ---------------------------------------------------------------------------

/// Cloud bucket client.
///
/// Reads use the plain `https://storage.googleapis.com/{bucket}/{object}`
/// form (object names keep their slashes); writes and listings go through
/// the JSON API where the object name travels as a query parameter, so no
/// manual percent-encoding is needed anywhere.
pub struct GcsStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    token: Option<String>,
    timeout_secs: u64,
}

impl GcsStore {
    pub fn new(bucket: &str, token: Option<String>, timeout: Duration) -> Self {
        Self::with_base_url("https://storage.googleapis.com", bucket, token, timeout)
    }

    /// Point the client at a different endpoint (used by tests against a
    /// local stub server).
    pub fn with_base_url(
        base_url: &str,
        bucket: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            token,
            timeout_secs: timeout.as_secs(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> StorageError {
        if err.is_timeout() {
            StorageError::Timeout(self.timeout_secs)
        } else {
            StorageError::Http(err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let response = self
            .authorize(self.client.get(self.object_url(path)))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url, self.bucket
        );
        let response = self
            .authorize(self.client.post(url))
            .query(&[("uploadType", "media"), ("name", path)])
            .body(bytes)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let response = self
            .authorize(self.client.get(url))
            .query(&[("prefix", prefix), ("fields", "items/name")])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;
        Ok(parsed.items.into_iter().map(|i| i.name).collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore — in-process store for tests and local development
// ---------------------------------------------------------------------------

/// HashMap-backed store. Ordered keys so `list` output is deterministic.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object synchronously (test fixtures).
    pub fn insert(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .expect("memory store lock")
            .insert(path.to_string(), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("memory store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .objects
            .lock()
            .expect("memory store lock")
            .get(path)
            .cloned())
    }

    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.objects
            .lock()
            .expect("memory store lock")
            .insert(path.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .lock()
            .expect("memory store lock")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
