use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::blobstore::BlobStore;
use crate::config::Config;
use crate::error::PipelineError;
use crate::retry::with_backoff;
use crate::types::{
    deep_link, FetchedAsset, PublishedRecord, RecordStatus, TemplateDescriptor, Thumbnail,
};

/// Stage contract: uploaded artifacts assembled into the final record.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        desc: &TemplateDescriptor,
        asset: &FetchedAsset,
        thumb: &Thumbnail,
    ) -> Result<PublishedRecord, PipelineError>;
}

/// Uploads video then thumbnail through the blob store, each with its own
/// retry budget, and preserves partial success: a published video with a
/// permanently failed thumbnail still yields a (partial) record.
pub struct BlobPublisher {
    store: Arc<dyn BlobStore>,
    max_attempts: u32,
    base_backoff: std::time::Duration,
}

impl BlobPublisher {
    pub fn new(store: Arc<dyn BlobStore>, cfg: &Config) -> Self {
        Self {
            store,
            max_attempts: cfg.max_transfer_attempts,
            base_backoff: cfg.base_backoff,
        }
    }

    async fn upload_with_retry(
        &self,
        path: &std::path::Path,
        filename_hint: &str,
        id: &str,
        what: &'static str,
    ) -> Result<String, PipelineError> {
        with_backoff(what, self.max_attempts, self.base_backoff, || {
            self.store.upload(path, filename_hint, id, what)
        })
        .await
    }
}

#[async_trait]
impl Publisher for BlobPublisher {
    async fn publish(
        &self,
        desc: &TemplateDescriptor,
        asset: &FetchedAsset,
        thumb: &Thumbnail,
    ) -> Result<PublishedRecord, PipelineError> {
        let video_url = self
            .upload_with_retry(
                &asset.local_video_path,
                &format!("{}.mp4", desc.id),
                &desc.id,
                "video",
            )
            .await?;

        // The video is already public at this point; a dead thumbnail must
        // not discard that work.
        let (thumbnail_url, status) = match self
            .upload_with_retry(
                &thumb.local_image_path,
                &format!("{}.jpg", desc.id),
                &desc.id,
                "thumbnail",
            )
            .await
        {
            Ok(url) => (url, RecordStatus::Ok),
            Err(e) => {
                warn!("Thumbnail upload failed for {}, keeping video: {}", desc.id, e);
                (String::new(), RecordStatus::Partial)
            }
        };

        info!("Published {} ({})", desc.id, status.as_str());
        Ok(PublishedRecord {
            id: desc.id.clone(),
            title: desc.title.clone(),
            video_url,
            thumbnail_url,
            deep_link: deep_link(&desc.id),
            status,
        })
    }
}
