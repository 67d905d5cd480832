use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Config;
use crate::error::PipelineError;
use crate::render::PageRenderer;
use crate::retry::with_backoff;
use crate::types::{FetchedAsset, TemplateDescriptor};

/// Stage contract: descriptor in, preview video in scratch storage out.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, desc: &TemplateDescriptor) -> Result<FetchedAsset, PipelineError>;
}

/// Resolves the template page to a direct media URL through the renderer and
/// streams the video to scratch storage.
pub struct HttpAssetFetcher {
    renderer: Arc<dyn PageRenderer>,
    client: reqwest::Client,
    cfg: Config,
}

impl HttpAssetFetcher {
    pub fn new(renderer: Arc<dyn PageRenderer>, cfg: Config) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.network_timeout)
            .build()
            .map_err(|e| PipelineError::Transfer {
                id: String::new(),
                reason: format!("http client: {}", e),
            })?;
        Ok(Self {
            renderer,
            client,
            cfg,
        })
    }

    async fn download_once(
        &self,
        id: &str,
        media_url: &str,
        dest: &Path,
    ) -> Result<(u64, String), PipelineError> {
        let transfer = |reason: String| PipelineError::Transfer {
            id: id.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(media_url)
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            if status.is_client_error() && status.as_u16() != 429 {
                // The media link itself is dead; retrying will not revive it.
                return Err(PipelineError::Resolution { id: id.to_string() });
            }
            return Err(transfer(format!("status {}", status)));
        }

        // Cheap rejection before any bytes move.
        if let Some(len) = resp.content_length() {
            if len > self.cfg.max_download_bytes {
                return Err(PipelineError::TooLarge {
                    id: id.to_string(),
                    size: len,
                    cap: self.cfg.max_download_bytes,
                });
            }
        }

        drain_stream_to_file(id, resp.bytes_stream(), dest, self.cfg.max_download_bytes).await
    }
}

#[async_trait]
impl Fetcher for HttpAssetFetcher {
    async fn fetch(&self, desc: &TemplateDescriptor) -> Result<FetchedAsset, PipelineError> {
        let id = desc.id.clone();

        // Second renderer round-trip: the search page does not carry the
        // direct media URL, the template page does.
        let source_url = desc.source_url.clone();
        let html = with_backoff(
            "resolve",
            self.cfg.max_transfer_attempts,
            self.cfg.base_backoff,
            || {
                let id = id.clone();
                let url = source_url.clone();
                async move {
                    self.renderer
                        .render(&url)
                        .await
                        .map_err(|e| PipelineError::Transfer {
                            id,
                            reason: e.to_string(),
                        })
                }
            },
        )
        .await?;

        let media_url =
            extract_media_url(&html).ok_or_else(|| PipelineError::Resolution { id: id.clone() })?;
        debug!("Resolved media url for {}: {}", id, media_url);

        let dir = self.cfg.scratch_for(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::Transfer {
                id: id.clone(),
                reason: format!("scratch dir: {}", e),
            })?;
        let dest = dir.join("preview.mp4");

        let (byte_size, checksum) = with_backoff(
            "download",
            self.cfg.max_transfer_attempts,
            self.cfg.base_backoff,
            || self.download_once(&id, &media_url, &dest),
        )
        .await?;

        Ok(FetchedAsset {
            descriptor_id: id,
            local_video_path: dest,
            byte_size,
            checksum,
        })
    }
}

/// Stream chunks to `dest`, hashing as they arrive and aborting past `cap`.
/// Returns the byte count and the hex SHA-256 checksum.
pub async fn drain_stream_to_file<S, B, E>(
    id: &str,
    mut stream: S,
    dest: &Path,
    cap: u64,
) -> Result<(u64, String), PipelineError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let transfer = |reason: String| PipelineError::Transfer {
        id: id.to_string(),
        reason,
    };

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| transfer(format!("create {}: {}", dest.display(), e)))?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| transfer(e.to_string()))?;
        let bytes = chunk.as_ref();
        written += bytes.len() as u64;
        if written > cap {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(PipelineError::TooLarge {
                id: id.to_string(),
                size: written,
                cap,
            });
        }
        hasher.update(bytes);
        file.write_all(bytes)
            .await
            .map_err(|e| transfer(e.to_string()))?;
    }

    file.flush().await.map_err(|e| transfer(e.to_string()))?;
    Ok((written, hex::encode(hasher.finalize())))
}

/// Find a direct video URL in a rendered template page. Checks `<video>` and
/// `<source>` src attributes first, then any bare .mp4 URL in the markup.
pub fn extract_media_url(html: &str) -> Option<String> {
    let patterns = [
        r#"<video[^>]+src="([^"]+)""#,
        r#"<source[^>]+src="([^"]+)""#,
        r#"(https://[^"'\s\\]+\.mp4[^"'\s\\]*)"#,
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        for cap in re.captures_iter(html) {
            let raw = cap[1].replace("&amp;", "&");
            let url = if let Some(rest) = raw.strip_prefix("//") {
                format!("https://{}", rest)
            } else {
                raw
            };
            if url.starts_with("https://") || url.starts_with("http://") {
                return Some(url);
            }
        }
    }
    None
}
