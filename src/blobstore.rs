use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PipelineError;

/// Anonymous file-hosting capability: local bytes in, public URL out.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        path: &Path,
        filename_hint: &str,
        descriptor_id: &str,
        what: &'static str,
    ) -> Result<String, PipelineError>;
}

/// Blob store backed by the Catbox anonymous upload endpoint.
pub struct CatboxStore {
    client: reqwest::Client,
    endpoint: String,
}

const CATBOX_ENDPOINT: &str = "https://catbox.moe/user/api.php";

impl CatboxStore {
    pub fn new(timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Upload {
                id: String::new(),
                what: "client",
                reason: e.to_string(),
                transient: false,
            })?;
        Ok(Self {
            client,
            endpoint: CATBOX_ENDPOINT.to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for CatboxStore {
    async fn upload(
        &self,
        path: &Path,
        filename_hint: &str,
        descriptor_id: &str,
        what: &'static str,
    ) -> Result<String, PipelineError> {
        let upload_err = |reason: String, transient: bool| PipelineError::Upload {
            id: descriptor_id.to_string(),
            what,
            reason,
            transient,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| upload_err(format!("read {}: {}", path.display(), e), false))?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename_hint.to_string());
        let form = reqwest::multipart::Form::new()
            .text("reqtype", "fileupload")
            .part("fileToUpload", part);

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| upload_err(e.to_string(), true))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| upload_err(e.to_string(), true))?;

        classify_response(status, &body, descriptor_id, what)
    }
}

/// Map one Catbox response to a public URL or a classified failure. The host
/// answers 200 with either a URL or a plain-text error message; 5xx and 429
/// are worth retrying, other rejections are final.
fn classify_response(
    status: reqwest::StatusCode,
    body: &str,
    descriptor_id: &str,
    what: &'static str,
) -> Result<String, PipelineError> {
    let upload_err = |reason: String, transient: bool| PipelineError::Upload {
        id: descriptor_id.to_string(),
        what,
        reason,
        transient,
    };

    if !status.is_success() {
        let transient = status.is_server_error() || status.as_u16() == 429;
        return Err(upload_err(format!("status {}: {}", status, body), transient));
    }

    let url = body.trim();
    if url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Err(upload_err(format!("host rejected upload: {}", url), false))
    }
}
