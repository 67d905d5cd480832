use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A template discovered by search, before any asset work.
///
/// `id` is the numeric CapCut template id and is stable across runs; it keys
/// the dedup ledger and the output dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDescriptor {
    pub id: String,
    pub title: String,
    pub source_url: String,
}

/// A preview video downloaded to scratch storage.
///
/// Scratch artifacts live under `<scratch>/<id>/` and are deleted once the
/// descriptor reaches a terminal state.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub descriptor_id: String,
    pub local_video_path: PathBuf,
    pub byte_size: u64,
    pub checksum: String,
}

/// A still frame derived from exactly one [`FetchedAsset`].
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub descriptor_id: String,
    pub local_image_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Partial,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ok => "ok",
            RecordStatus::Partial => "partial",
            RecordStatus::Failed => "failed",
        }
    }
}

/// One row of the output dataset. Append-only, at most one per template id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub id: String,
    pub title: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub deep_link: String,
    pub status: RecordStatus,
}

const DEEP_LINK_TEMPLATE: (&str, &str, &str) = (
    "https://capcut-yt.onelink.me/W3Oy/cw7bmax3?af_dp=capcut%3A%2F%2Ftemplate%2Fdetail%3Fenter_app%3Dother%26enter_from%3DSEO_detail_page%26template_id%3D",
    "%26template_language%3DNone&af_xp=social&deep_link_sub1=%7B%22share_token%22%3A%22None%22%7D&deep_link_value=capcut%253A%252F%252Ftemplate%252Fdetail%253Fenter_app%253Dother%2526enter_from%253DSEO_detail_page%2526template_id%253D",
    "%2526template_language%253DNone&is_retargeting=true&pid=SEO_detail",
);

/// Build the CapCut app deep link for a template id.
///
/// Pure string templating against the platform's onelink scheme; no network
/// involved, so the result is byte-identical across runs.
pub fn deep_link(template_id: &str) -> String {
    let (head, mid, tail) = DEEP_LINK_TEMPLATE;
    format!("{head}{template_id}{mid}{template_id}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_link_is_deterministic() {
        let a = deep_link("abc123");
        let b = deep_link("abc123");
        assert_eq!(a, b);
        assert!(a.starts_with("https://capcut-yt.onelink.me/"));
        // The id appears in both the direct and the url-encoded deep_link_value slot.
        assert_eq!(a.matches("abc123").count(), 2);
    }

    #[test]
    fn record_status_serializes_lowercase() {
        assert_eq!(RecordStatus::Ok.as_str(), "ok");
        assert_eq!(
            serde_json::to_string(&RecordStatus::Partial).unwrap(),
            "\"partial\""
        );
    }
}
