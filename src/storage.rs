//! Object access through single-object capability tokens.
//!
//! A [`CapabilityToken`] already carries the object identity, the permission
//! and the expiry, so the store never needs account credentials and offers no
//! listing. Over HTTP a token is a pre-signed URL (for example a blob URL with
//! a SAS query string).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Capability token expired for {0}")]
    ExpiredToken(String),

    #[error("Capability token does not allow this operation on {0}")]
    Forbidden(String),

    #[error("Invalid capability token: {0}")]
    InvalidToken(String),

    #[error("Unexpected status {status} for {object}")]
    UnexpectedStatus { status: u16, object: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl StorageError {
    /// Whether the failure came from the backend or network rather than the token or object.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transport(_) => true,
            StorageError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Opaque, time-boxed credential for one permission on one object.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Signed expiry carried by a SAS style `se` query parameter, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let url = Url::parse(&self.0).ok()?;
        let (_, value) = url.query_pairs().find(|(key, _)| key == "se")?;
        DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| at <= Utc::now())
    }

    /// Object location with the signature stripped, safe to log.
    pub fn object(&self) -> String {
        match Url::parse(&self.0) {
            Ok(mut url) => {
                url.set_query(None);
                url.to_string()
            }
            Err(_) => "<opaque>".to_string(),
        }
    }
}

impl FromStr for CapabilityToken {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(StorageError::InvalidToken("empty token".into()));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(StorageError::InvalidToken(
                "token contains whitespace or control characters".into(),
            ));
        }
        Ok(CapabilityToken(s.to_string()))
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Tokens are credentials; keep them out of debug logs.
impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityToken({})", self.object())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read_all(&self, token: &CapabilityToken) -> StorageResult<Vec<u8>>;

    /// Store `data` as the complete object. Readers never observe a partial write.
    async fn write_all(&self, token: &CapabilityToken, data: Vec<u8>) -> StorageResult<()>;

    /// Delete the object; a missing object counts as success.
    async fn delete_if_exists(&self, token: &CapabilityToken) -> StorageResult<()>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn read_all(&self, token: &CapabilityToken) -> StorageResult<Vec<u8>> {
        (**self).read_all(token).await
    }

    async fn write_all(&self, token: &CapabilityToken, data: Vec<u8>) -> StorageResult<()> {
        (**self).write_all(token, data).await
    }

    async fn delete_if_exists(&self, token: &CapabilityToken) -> StorageResult<()> {
        (**self).delete_if_exists(token).await
    }
}

/// Object store speaking plain HTTP against pre-signed URLs.
#[derive(Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(timeout: Duration) -> StorageResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(token: &CapabilityToken) -> StorageResult<Url> {
        if token.is_expired() {
            return Err(StorageError::ExpiredToken(token.object()));
        }
        Url::parse(token.as_str()).map_err(|e| StorageError::InvalidToken(e.to_string()))
    }

    fn classify(status: StatusCode, token: &CapabilityToken) -> StorageError {
        match status {
            StatusCode::NOT_FOUND => StorageError::NotFound(token.object()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED if token.is_expired() => {
                StorageError::ExpiredToken(token.object())
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                StorageError::Forbidden(token.object())
            }
            other => StorageError::UnexpectedStatus {
                status: other.as_u16(),
                object: token.object(),
            },
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn read_all(&self, token: &CapabilityToken) -> StorageResult<Vec<u8>> {
        let response = self.client.get(Self::url(token)?).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify(response.status(), token));
        }
        let body = response.bytes().await?;
        debug!(object = %token.object(), bytes = body.len(), "Read object");
        Ok(body.to_vec())
    }

    async fn write_all(&self, token: &CapabilityToken, data: Vec<u8>) -> StorageResult<()> {
        let len = data.len();
        // Single-shot PUT: the store commits the blob only once the full body arrives.
        let response = self
            .client
            .put(Self::url(token)?)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(data)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify(response.status(), token));
        }
        debug!(object = %token.object(), bytes = len, "Wrote object");
        Ok(())
    }

    async fn delete_if_exists(&self, token: &CapabilityToken) -> StorageResult<()> {
        let response = self.client.delete(Self::url(token)?).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(object = %token.object(), "Object already gone");
                Ok(())
            }
            status => Err(Self::classify(status, token)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Delete,
}

#[derive(Debug, Clone)]
struct Grant {
    key: String,
    permission: Permission,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: HashMap<String, Vec<u8>>,
    grants: HashMap<CapabilityToken, Grant>,
}

/// In-process object store. Tokens must be granted before use.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, token: &str, key: &str, permission: Permission) {
        self.grant_until(token, key, permission, None);
    }

    pub fn grant_until(
        &self,
        token: &str,
        key: &str,
        permission: Permission,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let grant = Grant {
            key: key.to_string(),
            permission,
            expires_at,
        };
        self.lock()
            .grants
            .insert(CapabilityToken(token.to_string()), grant);
    }

    pub fn put_object(&self, key: &str, data: Vec<u8>) {
        self.lock().objects.insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock cannot leave a map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn authorize(&self, token: &CapabilityToken, permission: Permission) -> StorageResult<String> {
        let inner = self.lock();
        let grant = inner
            .grants
            .get(token)
            .ok_or_else(|| StorageError::Forbidden("<unknown token>".into()))?;
        if grant.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(StorageError::ExpiredToken(grant.key.clone()));
        }
        if grant.permission != permission {
            return Err(StorageError::Forbidden(grant.key.clone()));
        }
        Ok(grant.key.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read_all(&self, token: &CapabilityToken) -> StorageResult<Vec<u8>> {
        let key = self.authorize(token, Permission::Read)?;
        self.object(&key).ok_or(StorageError::NotFound(key))
    }

    async fn write_all(&self, token: &CapabilityToken, data: Vec<u8>) -> StorageResult<()> {
        let key = self.authorize(token, Permission::Write)?;
        self.put_object(&key, data);
        Ok(())
    }

    async fn delete_if_exists(&self, token: &CapabilityToken) -> StorageResult<()> {
        let key = self.authorize(token, Permission::Delete)?;
        self.lock().objects.remove(&key);
        Ok(())
    }
}
