use thiserror::Error;

/// Failure taxonomy for the acquisition-and-publish pipeline.
///
/// Transient errors are retried with backoff inside the failing stage; once
/// the attempt budget is spent they propagate and the descriptor is marked
/// failed. Only [`PipelineError::Discovery`] aborts a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No parseable search results. Fatal for the run.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Template page yielded no direct media URL. Permanent per descriptor.
    #[error("no media url found on template page for {id}")]
    Resolution { id: String },

    /// Network or timeout failure while moving bytes. Transient.
    #[error("transfer failed for {id}: {reason}")]
    Transfer { id: String, reason: String },

    /// Download exceeded the configured size cap. Permanent per descriptor.
    #[error("media for {id} exceeds size cap ({size} > {cap} bytes)")]
    TooLarge { id: String, size: u64, cap: u64 },

    /// Video cannot be opened or has zero duration. Permanent per asset.
    #[error("cannot decode video for {id}: {reason}")]
    Decode { id: String, reason: String },

    /// Blob store upload failure; transient or permanent depending on cause.
    #[error("{what} upload failed for {id}: {reason}")]
    Upload {
        id: String,
        what: &'static str,
        reason: String,
        transient: bool,
    },
}

impl PipelineError {
    /// Whether a local retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Transfer { .. } => true,
            PipelineError::Upload { transient, .. } => *transient,
            _ => false,
        }
    }
}
