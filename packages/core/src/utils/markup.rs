//! Markup utilities for search indexing, metadata and export
//!
//! Note content is free-form rich markup (HTML produced by an editor, with
//! the occasional markdown-ish fragment pasted in). These helpers reduce it
//! to plain text for substring search and word counts, pull out outgoing
//! links, and convert it to Markdown for the export module.

use regex::Regex;
use std::sync::LazyLock;

/// Block-level tags that separate words when removed
static BLOCK_BREAK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br\s*/?|/p|/div|/li|/h[1-6]|/tr|/blockquote|/pre)\s*>").unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap());

static BARE_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"']+"#).unwrap());

/// HTML to Markdown rewrites, applied in order before remaining tags are dropped.
///
/// Order matters: links before emphasis (anchors can wrap bold text), bold
/// before italic, headings before the generic block break.
static MARKDOWN_REWRITES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap(),
            "[$2]($1)",
        ),
        (Regex::new(r"(?is)<(strong|b)>(.*?)</(strong|b)>").unwrap(), "**$2**"),
        (Regex::new(r"(?is)<(em|i)>(.*?)</(em|i)>").unwrap(), "*$2*"),
        (Regex::new(r"(?is)<(s|strike|del)>(.*?)</(s|strike|del)>").unwrap(), "~~$2~~"),
        (Regex::new(r"(?is)<code>(.*?)</code>").unwrap(), "`$1`"),
        (Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap(), "\n# $1\n"),
        (Regex::new(r"(?is)<h2[^>]*>(.*?)</h2>").unwrap(), "\n## $1\n"),
        (Regex::new(r"(?is)<h3[^>]*>(.*?)</h3>").unwrap(), "\n### $1\n"),
        (Regex::new(r"(?is)<h[4-6][^>]*>(.*?)</h[4-6]>").unwrap(), "\n#### $1\n"),
        (Regex::new(r"(?is)<li[^>]*>(.*?)</li>").unwrap(), "\n- $1"),
        (Regex::new(r"(?is)<blockquote[^>]*>(.*?)</blockquote>").unwrap(), "\n> $1\n"),
        (Regex::new(r"(?i)<\s*br\s*/?\s*>").unwrap(), "\n"),
        (Regex::new(r"(?i)</\s*(p|div)\s*>").unwrap(), "\n\n"),
    ]
});

static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Strip markup from content, producing single-spaced plain text
///
/// # Examples
///
/// ```
/// use notekeep_core::utils::strip_markup;
///
/// assert_eq!(strip_markup("<p>Hello <b>world</b></p>"), "Hello world");
/// assert_eq!(strip_markup("one<br>two"), "one two");
/// assert_eq!(strip_markup("fish &amp; chips"), "fish & chips");
/// ```
pub fn strip_markup(content: &str) -> String {
    let spaced = BLOCK_BREAK_RE.replace_all(content, " ");
    let untagged = TAG_RE.replace_all(&spaced, "");
    let decoded = decode_entities(&untagged);
    WHITESPACE_RE.replace_all(&decoded, " ").trim().to_string()
}

/// Count whitespace-separated words in the plain-text rendering of `content`
pub fn word_count(content: &str) -> u64 {
    strip_markup(content).split_whitespace().count() as u64
}

/// Collect outgoing links: `href` targets first, then bare URLs, de-duplicated
/// in first-seen order.
pub fn extract_links(content: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    let hrefs = HREF_RE.captures_iter(content).map(|c| c[1].to_string());
    let bare = BARE_URL_RE.find_iter(content).map(|m| m.as_str().to_string());

    for link in hrefs.chain(bare) {
        if !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

/// Convert editor markup to Markdown for export
pub fn markup_to_markdown(content: &str) -> String {
    let mut result = content.to_string();
    for (pattern, replacement) in MARKDOWN_REWRITES.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    let untagged = TAG_RE.replace_all(&result, "");
    let decoded = decode_entities(&untagged);

    let trimmed_lines = decoded
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES_RE
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

/// Escape text for inclusion in an HTML document
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
