use anyhow::Result;
use async_trait::async_trait;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};

/// Opaque page-rendering capability: URL in, rendered HTML out.
///
/// The pipeline never looks inside the renderer; any headless-rendering or
/// HTTP-scraping mechanism works, and tests substitute canned documents.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String>;
}

/// Renderer backed by the spider.cloud scraping API.
pub struct SpiderRenderer {
    spider: Spider,
}

impl SpiderRenderer {
    /// Reads the API key from `SPIDER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| anyhow::anyhow!("SPIDER_API_KEY environment variable must be set"))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self { spider })
    }
}

#[async_trait]
impl PageRenderer for SpiderRenderer {
    async fn render(&self, url: &str) -> Result<String> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| anyhow::anyhow!("Spider scrape failed: {}", e))?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };

        let content = parsed
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("No content in spider response for {}", url))?;

        if content.trim().is_empty() {
            anyhow::bail!("Empty render result for {}", url);
        }

        Ok(content.to_string())
    }
}
