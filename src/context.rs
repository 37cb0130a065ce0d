//! Query context augmentation.
//!
//! URLs and bare domains mentioned in a query are fetched and their readable
//! text is appended after the query as reference material. A source that
//! can't be fetched is skipped.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::tools::html::{truncate_chars, HtmlText};
use crate::tools::net::{check_public_url, fetch_client, read_capped};

/// Bytes read per source
pub const MAX_SOURCE_BYTES: usize = 5 * 1024 * 1024;

/// Characters of readable text kept per source
pub const MAX_SOURCE_CHARS: usize = 12_000;

const USER_AGENT: &str = "chriseon/0.1 (+local dev)";

/// Augmented query plus the sources that contributed to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentedQuery {
    pub text: String,
    pub sources: Vec<String>,
}

impl AugmentedQuery {
    /// The query unchanged, with no sources
    pub fn unchanged(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn augment(&self, query: &str) -> anyhow::Result<AugmentedQuery>;
}

/// Returns every query unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn augment(&self, query: &str) -> anyhow::Result<AugmentedQuery> {
        Ok(AugmentedQuery::unchanged(query))
    }
}

/// Fetches URLs found in the query over HTTP
pub struct WebContextAugmenter {
    client: reqwest::Client,
    url_pattern: Regex,
    html: HtmlText,
}

impl WebContextAugmenter {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: fetch_client(USER_AGENT)?,
            url_pattern: url_pattern()?,
            html: HtmlText::new()?,
        })
    }

    async fn fetch_source(&self, url: &str) -> anyhow::Result<Option<String>> {
        let url = check_public_url(url).await?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = read_capped(response, MAX_SOURCE_BYTES).await?;

        let text = self.html.readable_text(&String::from_utf8_lossy(&body));
        let text = truncate_chars(&text, MAX_SOURCE_CHARS);
        Ok((!text.is_empty()).then_some(text))
    }
}

#[async_trait]
impl ContextSource for WebContextAugmenter {
    async fn augment(&self, query: &str) -> anyhow::Result<AugmentedQuery> {
        let urls = extract_urls(&self.url_pattern, query);
        if urls.is_empty() {
            return Ok(AugmentedQuery::unchanged(query));
        }

        let mut blocks = Vec::new();
        let mut sources = Vec::new();

        for url in urls {
            match self.fetch_source(&url).await {
                Ok(Some(text)) => {
                    debug!(url = %url, chars = text.chars().count(), "Fetched reference context");
                    blocks.push(format!(
                        "\n--- CONTENT FROM {} ---\n{}\n--- END CONTENT ---\n",
                        url, text
                    ));
                    sources.push(url);
                }
                Ok(None) => debug!(url = %url, "Source had no readable text"),
                Err(e) => warn!(url = %url, error = %e, "Skipping reference source"),
            }
        }

        if blocks.is_empty() {
            return Ok(AugmentedQuery::unchanged(query));
        }

        Ok(AugmentedQuery {
            text: compose(query, &blocks),
            sources,
        })
    }
}

/// Full URLs or bare domains
pub fn url_pattern() -> Result<Regex, regex::Error> {
    Regex::new(r"(?:https?://)?(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}(?:/[^\s]*)?")
}

/// Matches in order of appearance, normalized to https and deduplicated
pub fn extract_urls(pattern: &Regex, text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for m in pattern.find_iter(text) {
        let url = normalize_url(m.as_str());
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_end_matches(|c| matches!(c, ')' | '.' | ',' | ';' | '"'));
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Reference context goes after the question so the question keeps priority
fn compose(query: &str, blocks: &[String]) -> String {
    format!(
        "{}\n\n--- REFERENCE CONTEXT (use only if relevant to answer the question above) ---\n{}\n--- END REFERENCE CONTEXT ---\n",
        query,
        blocks.join("\n")
    )
}
