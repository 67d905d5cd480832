use std::path::PathBuf;
use std::time::Duration;

/// Tunables for a pipeline run. Everything has a sane default; the CLI
/// overrides individual fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrent descriptor chains.
    pub concurrency: usize,
    /// Attempts per transfer/upload before a transient error becomes permanent.
    pub max_transfer_attempts: u32,
    /// Base delay for exponential backoff between transfer attempts.
    pub base_backoff: Duration,
    /// Times a descriptor may end up `failed` (across runs) before the failure
    /// is recorded as terminal in the dataset.
    pub max_descriptor_attempts: u32,
    /// Render attempts per search page before discovery gives up.
    pub max_render_attempts: u32,
    /// Reject preview videos larger than this many bytes.
    pub max_download_bytes: u64,
    /// Per-request network timeout.
    pub network_timeout: Duration,
    /// Where in the video to grab the thumbnail frame, as a fraction of the
    /// total duration. Not 0.0: the first frame is often blank or mid-fade.
    pub thumbnail_offset_fraction: f64,
    pub scratch_dir: PathBuf,
    pub db_path: PathBuf,
    pub dataset_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_transfer_attempts: 4,
            base_backoff: Duration::from_millis(500),
            max_descriptor_attempts: 3,
            max_render_attempts: 3,
            max_download_bytes: 64 * 1024 * 1024,
            network_timeout: Duration::from_secs(60),
            thumbnail_offset_fraction: 0.25,
            scratch_dir: PathBuf::from("data/scratch"),
            db_path: PathBuf::from("data/templates.sqlite"),
            dataset_path: PathBuf::from("output/templates.csv"),
        }
    }
}

impl Config {
    /// Scratch directory for one descriptor, namespaced by id so concurrent
    /// workers never collide.
    pub fn scratch_for(&self, descriptor_id: &str) -> PathBuf {
        self.scratch_dir.join(descriptor_id)
    }
}
