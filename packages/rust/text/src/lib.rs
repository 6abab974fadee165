//! HTML-to-text extraction for crawled pages.
//!
//! Two output formats:
//! - [`TextFormat::Plain`]: the visible text of the document, one block
//!   element per line, scripts and styles dropped
//! - [`TextFormat::Markdown`]: the main content converted with `htmd` and run
//!   through the cleanup pipeline
//!
//! Extraction is deterministic: the same HTML always yields the same text.

mod cleanup;

use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, instrument};
use url::Url;

use siteindexer_shared::{Result, SiteIndexerError, TextFormat};

/// Elements whose content is never visible text.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "head", "iframe", "canvas",
];

/// Elements that start a new line in plain-text output.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "details", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "header", "hr", "li", "main", "nav", "ol", "p", "pre", "section", "summary", "table", "tr",
    "ul",
];

/// Result of extracting text from an HTML page.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    /// The normalized text, ending with a single newline.
    pub text: String,
    /// `<title>` or first `<h1>`, if any.
    pub title: Option<String>,
    pub word_count: usize,
}

/// Extract text from `html` fetched from `source_url`.
#[instrument(skip(html, source_url), fields(url = source_url))]
pub fn extract(html: &str, source_url: &str, format: TextFormat) -> Result<ExtractedText> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);

    let text = match format {
        TextFormat::Plain => cleanup::plain_pipeline(&visible_text(&doc)),
        TextFormat::Markdown => {
            let content_html = extract_content_html(&doc);
            let converter = htmd::HtmlToMarkdown::builder()
                .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
                .build();
            let raw = converter.convert(&content_html).map_err(|e| {
                SiteIndexerError::Conversion(format!("htmd conversion failed: {e}"))
            })?;
            let base_url = Url::parse(source_url).ok();
            cleanup::markdown_pipeline(&raw, base_url.as_ref())
        }
    };

    let word_count = text.split_whitespace().count();
    debug!(word_count, len = text.len(), "text extracted");

    Ok(ExtractedText {
        text,
        title,
        word_count,
    })
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

/// Collect the visible text of the document.
fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    walk(doc.root_element(), &mut out);
    out
}

fn walk(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                let name = element.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let is_block = BLOCK_TAGS.contains(&name);
                if is_block {
                    out.push('\n');
                } else if matches!(name, "td" | "th") {
                    out.push(' ');
                }
                walk(child_el, out);
                if is_block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Main content HTML for Markdown conversion, falling back to `<body>`.
fn extract_content_html(doc: &Html) -> String {
    let selectors = ["article", "main", "[role=\"main\"]", "body"];

    for sel_str in &selectors {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    doc.root_element().inner_html()
}

fn extract_title(doc: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|sel_str| {
        let selector = Selector::parse(sel_str).ok()?;
        let el = doc.select(&selector).next()?;
        let text = el.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html>
<head><title>Contoso  Docs</title><style>body { color: red }</style></head>
<body>
  <nav><a href="/">Home</a></nav>
  <main>
    <h1>Getting started</h1>
    <p>Install the <strong>CLI</strong>, then run it.</p>
    <script>console.log("hidden")</script>
    <ul><li>One</li><li>Two</li></ul>
    <table><tr><th>Name</th><th>Value</th></tr><tr><td>a</td><td>1</td></tr></table>
  </main>
</body>
</html>"#;

    #[test]
    fn plain_text_drops_scripts_and_keeps_blocks() {
        let out = extract(PAGE, "https://example.com/start", TextFormat::Plain).unwrap();

        assert!(out.text.contains("Getting started\n"));
        assert!(out.text.contains("Install the CLI, then run it."));
        assert!(out.text.contains("One\n"));
        assert!(out.text.contains("Name Value"));
        assert!(!out.text.contains("hidden"));
        assert!(!out.text.contains("color: red"));
        assert!(out.text.ends_with('\n'));
        assert!(!out.text.ends_with("\n\n"));
        assert_eq!(out.title.as_deref(), Some("Contoso Docs"));
    }

    #[test]
    fn plain_text_is_deterministic() {
        let a = extract(PAGE, "https://example.com/start", TextFormat::Plain).unwrap();
        let b = extract(PAGE, "https://example.com/start", TextFormat::Plain).unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.word_count, b.word_count);
    }

    #[test]
    fn markdown_uses_main_content() {
        let out = extract(PAGE, "https://example.com/start", TextFormat::Markdown).unwrap();

        assert!(out.text.contains("# Getting started"));
        assert!(out.text.contains("**CLI**"));
        assert!(!out.text.contains("Home"));
        assert!(!out.text.contains("hidden"));
    }

    #[test]
    fn title_falls_back_to_h1() {
        let html = "<html><body><h1>Only heading</h1><p>x</p></body></html>";
        let out = extract(html, "https://example.com/", TextFormat::Plain).unwrap();
        assert_eq!(out.title.as_deref(), Some("Only heading"));
    }

    #[test]
    fn empty_document() {
        let out = extract("<html><body></body></html>", "https://example.com/", TextFormat::Plain)
            .unwrap();
        assert_eq!(out.text, "\n");
        assert_eq!(out.word_count, 0);
        assert!(out.title.is_none());
    }
}
