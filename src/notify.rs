//! Client for the service that owns photo metadata.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Media service rejected update for {media_id}: status {status}")]
    Rejected { media_id: i64, status: u16 },

    #[error("Invalid media service url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizedUris {
    pub media_id: i64,
    pub large_uri: String,
    pub medium_uri: String,
    pub thumbnail_uri: String,
}

#[async_trait]
pub trait MediaService: Send + Sync {
    /// Report where the resized variants of `media_id` were written.
    ///
    /// Receivers must tolerate duplicates: the same update may arrive more
    /// than once when a job is redelivered.
    async fn update_resized_photo_blob_uris(&self, uris: &ResizedUris) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T: MediaService + ?Sized> MediaService for Arc<T> {
    async fn update_resized_photo_blob_uris(&self, uris: &ResizedUris) -> Result<(), NotifyError> {
        (**self).update_resized_photo_blob_uris(uris).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpMediaService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpMediaService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl MediaService for HttpMediaService {
    async fn update_resized_photo_blob_uris(&self, uris: &ResizedUris) -> Result<(), NotifyError> {
        let url = self
            .base_url
            .join(&format!("media/{}/resized-uris", uris.media_id))?;
        let response = self.client.post(url).json(uris).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                media_id: uris.media_id,
                status: status.as_u16(),
            });
        }
        debug!(media_id = uris.media_id, "Media service accepted resized uris");
        Ok(())
    }
}

/// Records every update in memory; can be switched into a failing mode.
#[derive(Debug, Clone, Default)]
pub struct MemoryMediaService {
    calls: Arc<Mutex<Vec<ResizedUris>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryMediaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every update is rejected with a 503.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ResizedUris> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MediaService for MemoryMediaService {
    async fn update_resized_photo_blob_uris(&self, uris: &ResizedUris) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(uris.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                media_id: uris.media_id,
                status: 503,
            });
        }
        Ok(())
    }
}
