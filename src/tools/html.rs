//! Readable-text extraction from HTML pages.

use regex::Regex;

/// Elements whose content never counts as readable text
const STRIPPED_ELEMENTS: [&str; 5] = ["script", "style", "nav", "footer", "noscript"];

/// Compiled patterns for turning a page into plain text
#[derive(Debug, Clone)]
pub struct HtmlText {
    stripped: Vec<Regex>,
    comment: Regex,
    tag: Regex,
    title: Regex,
    whitespace: Regex,
}

impl HtmlText {
    pub fn new() -> Result<Self, regex::Error> {
        let stripped = STRIPPED_ELEMENTS
            .iter()
            .map(|name| Regex::new(&format!(r"(?is)<{0}\b[^>]*>.*?</{0}\s*>", name)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            stripped,
            comment: Regex::new(r"(?s)<!--.*?-->")?,
            tag: Regex::new(r"<[^>]*>")?,
            title: Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    /// Page title, if any
    pub fn title(&self, html: &str) -> Option<String> {
        let raw = self.title.captures(html)?.get(1)?.as_str();
        let title = self.collapse(&decode_entities(raw));
        (!title.is_empty()).then_some(title)
    }

    /// Visible text with tags removed and whitespace collapsed
    pub fn readable_text(&self, html: &str) -> String {
        let mut text = self.comment.replace_all(html, " ").into_owned();
        for pattern in &self.stripped {
            text = pattern.replace_all(&text, " ").into_owned();
        }
        let text = self.tag.replace_all(&text, " ");
        self.collapse(&decode_entities(&text))
    }

    fn collapse(&self, text: &str) -> String {
        self.whitespace.replace_all(text, " ").trim().to_string()
    }
}

/// Decode the handful of entities that matter for plain text
pub fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// First `max` characters (never splits a code point)
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}
