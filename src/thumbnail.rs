use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::error::PipelineError;
use crate::types::{FetchedAsset, Thumbnail};

/// Stage contract: local video in, representative still frame out.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, asset: &FetchedAsset) -> Result<Thumbnail, PipelineError>;
}

/// Frame extraction via ffprobe/ffmpeg subprocesses.
pub struct FfmpegExtractor {
    offset_fraction: f64,
}

impl FfmpegExtractor {
    pub fn new(cfg: &Config) -> Self {
        Self {
            offset_fraction: cfg.thumbnail_offset_fraction,
        }
    }
}

#[async_trait]
impl Extractor for FfmpegExtractor {
    async fn extract(&self, asset: &FetchedAsset) -> Result<Thumbnail, PipelineError> {
        let id = &asset.descriptor_id;
        let decode = |reason: String| PipelineError::Decode {
            id: id.clone(),
            reason,
        };

        let probe = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(&asset.local_video_path)
            .output()
            .await
            .map_err(|e| decode(format!("ffprobe: {}", e)))?;

        if !probe.status.success() {
            return Err(decode(format!(
                "ffprobe: {}",
                String::from_utf8_lossy(&probe.stderr).trim()
            )));
        }

        let duration = parse_duration(&String::from_utf8_lossy(&probe.stdout))
            .ok_or_else(|| decode("unreadable duration".to_string()))?;
        if duration <= 0.0 {
            return Err(decode("zero duration".to_string()));
        }

        // A fraction into the clip rather than frame 0, which is frequently
        // blank or mid-fade on template previews.
        let timestamp = duration * self.offset_fraction;
        let out_path = asset.local_video_path.with_file_name("thumb.jpg");
        debug!("Extracting frame for {} at {:.2}s", id, timestamp);

        let ffmpeg = Command::new("ffmpeg")
            .arg("-y")
            .arg("-ss")
            .arg(format!("{:.3}", timestamp))
            .arg("-i")
            .arg(&asset.local_video_path)
            .args(["-vframes", "1", "-q:v", "3"])
            .arg(&out_path)
            .output()
            .await
            .map_err(|e| decode(format!("ffmpeg: {}", e)))?;

        if !ffmpeg.status.success() {
            return Err(decode(format!(
                "ffmpeg: {}",
                String::from_utf8_lossy(&ffmpeg.stderr).trim()
            )));
        }
        if !out_path.exists() {
            return Err(decode("ffmpeg produced no frame".to_string()));
        }

        Ok(Thumbnail {
            descriptor_id: id.clone(),
            local_image_path: out_path,
        })
    }
}

fn parse_duration(ffprobe_stdout: &str) -> Option<f64> {
    ffprobe_stdout.trim().parse().ok()
}
