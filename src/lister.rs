use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::error::PipelineError;
use crate::render::PageRenderer;
use crate::types::TemplateDescriptor;

const EXPLORE_URL: &str = "https://www.capcut.com/explore";
const BASE_URL: &str = "https://www.capcut.com";
const MAX_PAGES: u32 = 20;

/// Discovers template descriptors for a search query by paginating the
/// explore page through the renderer.
pub struct TemplateLister {
    renderer: Arc<dyn PageRenderer>,
    max_render_attempts: u32,
}

impl TemplateLister {
    pub fn new(renderer: Arc<dyn PageRenderer>, cfg: &Config) -> Self {
        Self {
            renderer,
            max_render_attempts: cfg.max_render_attempts,
        }
    }

    /// List up to `max_results` descriptors for `query`.
    ///
    /// Pagination position is carried in the page cursor of the search URL,
    /// so a fresh call with the same query reproduces the same ordering.
    /// Fails with [`PipelineError::Discovery`] if the first page never yields
    /// a parseable result set.
    pub async fn list(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<TemplateDescriptor>, PipelineError> {
        let mut out: Vec<TemplateDescriptor> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for page in 1..=MAX_PAGES {
            if out.len() >= max_results {
                break;
            }

            let url = search_url(query, page);
            let html = match self.render_with_attempts(&url).await {
                Some(html) => html,
                None if page == 1 => {
                    return Err(PipelineError::Discovery(format!(
                        "no parseable results for query '{}' after {} render attempts",
                        query, self.max_render_attempts
                    )));
                }
                None => break,
            };

            let found = extract_descriptors(&html);
            if found.is_empty() {
                if page == 1 {
                    return Err(PipelineError::Discovery(format!(
                        "no template links on first results page for query '{}'",
                        query
                    )));
                }
                // Ran off the end of the result set.
                break;
            }

            let mut new_on_page = 0usize;
            for desc in found {
                if out.len() >= max_results {
                    break;
                }
                if seen.insert(desc.id.clone()) {
                    out.push(desc);
                    new_on_page += 1;
                }
            }

            // A page of nothing but repeats means the cursor stopped advancing.
            if new_on_page == 0 {
                break;
            }
        }

        info!("Query '{}': {} template(s) discovered", query, out.len());
        Ok(out)
    }

    async fn render_with_attempts(&self, url: &str) -> Option<String> {
        for attempt in 1..=self.max_render_attempts {
            match self.renderer.render(url).await {
                Ok(html) => return Some(html),
                Err(e) => warn!(
                    "Render failed for {} (attempt {}/{}): {}",
                    url, attempt, self.max_render_attempts, e
                ),
            }
        }
        None
    }
}

/// Search URL with an explicit page cursor.
pub fn search_url(query: &str, page: u32) -> String {
    let mut url = Url::parse(EXPLORE_URL).expect("static explore url");
    url.query_pairs_mut()
        .append_pair("q", query)
        .append_pair("page", &page.to_string());
    url.to_string()
}

/// Pull template descriptors out of a rendered results page.
pub fn extract_descriptors(html: &str) -> Vec<TemplateDescriptor> {
    let href_re = Regex::new(r#"href="([^"]*template-detail[^"]*)""#).expect("static regex");
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for cap in href_re.captures_iter(html) {
        let href = &cap[1];
        let full_url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", BASE_URL, href)
        };

        let Some(id) = extract_template_id(&full_url) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        out.push(TemplateDescriptor {
            title: title_from_url(&full_url),
            id,
            source_url: full_url,
        });
    }

    out
}

/// Extract the numeric template id from a CapCut URL. Pattern precedence
/// mirrors the URL shapes the platform has used: explicit query param, the
/// template-detail path, then any bare long-digit path segment.
pub fn extract_template_id(url: &str) -> Option<String> {
    let patterns = [
        r"template_id=(\d+)",
        r"template-detail/[^/]+/(\d+)",
        r"/(\d{16,20})(?:[/?#]|$)",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        if let Some(cap) = re.captures(url) {
            return Some(cap[1].to_string());
        }
    }
    None
}

/// Derive a human title from the template-detail slug, e.g.
/// `.../template-detail/glow-transition/7123...` -> "Glow Transition".
fn title_from_url(url: &str) -> String {
    let slug = url
        .split("template-detail/")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("");

    let title: String = slug
        .split('-')
        .filter(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        "Untitled Template".to_string()
    } else {
        title
    }
}
