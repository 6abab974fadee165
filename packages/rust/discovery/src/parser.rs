//! Sitemap XML parser.
//!
//! Handles the layouts seen in the wild:
//! - `<urlset>` with `<url><loc>…</loc><lastmod>…</lastmod></url>` blocks
//! - a flat list of `<loc>` elements, each followed by its `<lastmod>`
//! - `<sitemapindex>` documents listing child sitemaps
//!
//! Only the elements we need are extracted; everything else is ignored.

use regex::Regex;
use siteindexer_shared::{Result, SiteIndexerError};
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One `<loc>` with its raw `<lastmod>`, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
}

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    /// Page entries.
    UrlSet(Vec<SitemapEntry>),
    /// Locations of child sitemaps.
    Index(Vec<String>),
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<sitemapindex\b").expect("sitemapindex regex"));

static SITEMAP_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<sitemap\b[^>]*>(.*?)</sitemap>").expect("sitemap block regex")
});

static URL_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<url\b[^>]*>(.*?)</url>").expect("url block regex"));

static LOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<loc\b[^>]*>(.*?)</loc>").expect("loc regex"));

static LASTMOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<lastmod\b[^>]*>(.*?)</lastmod>").expect("lastmod regex")
});

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));

static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("cdata regex"));

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(amp|lt|gt|quot|apos|#[0-9]+|#x[0-9a-fA-F]+);").expect("entity regex")
});

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a sitemap document.
pub(crate) fn parse_sitemap(xml: &str) -> Result<SitemapDocument> {
    let xml = COMMENT_RE.replace_all(xml, "");

    if INDEX_RE.is_match(&xml) {
        let children: Vec<String> = SITEMAP_BLOCK_RE
            .captures_iter(&xml)
            .filter_map(|caps| first_text(&LOC_RE, &caps[1]))
            .collect();
        return Ok(SitemapDocument::Index(children));
    }

    let entries = if URL_BLOCK_RE.is_match(&xml) {
        parse_url_blocks(&xml)
    } else {
        parse_flat(&xml)
    };

    if entries.is_empty() && !xml.contains("<urlset") {
        return Err(SiteIndexerError::parse(
            "document is neither a urlset nor a sitemap index",
        ));
    }

    Ok(SitemapDocument::UrlSet(entries))
}

fn parse_url_blocks(xml: &str) -> Vec<SitemapEntry> {
    URL_BLOCK_RE
        .captures_iter(xml)
        .filter_map(|caps| {
            let block = &caps[1];
            let loc = first_text(&LOC_RE, block)?;
            Some(SitemapEntry {
                loc,
                lastmod: first_text(&LASTMOD_RE, block),
            })
        })
        .collect()
}

/// Each `<loc>` takes the first `<lastmod>` after it and before the next `<loc>`.
///
/// Both match lists are in document order, so one forward pass pairs them.
fn parse_flat(xml: &str) -> Vec<SitemapEntry> {
    let locs: Vec<(usize, usize, &str)> = LOC_RE
        .captures_iter(xml)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), caps.get(1)?.as_str()))
        })
        .collect();
    let lastmods: Vec<(usize, &str)> = LASTMOD_RE
        .captures_iter(xml)
        .filter_map(|caps| Some((caps.get(0)?.start(), caps.get(1)?.as_str())))
        .collect();

    let mut next_lastmod = 0;
    let mut entries = Vec::with_capacity(locs.len());
    for (i, &(_, loc_end, raw_loc)) in locs.iter().enumerate() {
        let window_end = locs.get(i + 1).map_or(xml.len(), |next| next.0);
        while lastmods.get(next_lastmod).is_some_and(|&(start, _)| start < loc_end) {
            next_lastmod += 1;
        }
        let lastmod = match lastmods.get(next_lastmod) {
            Some(&(start, text)) if start < window_end => {
                next_lastmod += 1;
                Some(clean_text(text)).filter(|s| !s.is_empty())
            }
            _ => None,
        };

        let loc = clean_text(raw_loc);
        if !loc.is_empty() {
            entries.push(SitemapEntry { loc, lastmod });
        }
    }
    entries
}

fn first_text(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .map(|caps| clean_text(&caps[1]))
        .filter(|s| !s.is_empty())
}

/// Strip CDATA wrappers, decode XML entities, trim.
fn clean_text(raw: &str) -> String {
    let without_cdata = CDATA_RE.replace_all(raw, "$1");
    let decoded = ENTITY_RE.replace_all(&without_cdata, |caps: &regex::Captures| {
        let entity = &caps[1];
        match entity {
            "amp" => "&".to_string(),
            "lt" => "<".to_string(),
            "gt" => ">".to_string(),
            "quot" => "\"".to_string(),
            "apos" => "'".to_string(),
            _ => decode_numeric(entity).unwrap_or_else(|| caps[0].to_string()),
        }
    });
    decoded.trim().to_string()
}

fn decode_numeric(entity: &str) -> Option<String> {
    let code = match entity.strip_prefix("#x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => entity.strip_prefix('#')?.parse().ok()?,
    };
    char::from_u32(code).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(loc: &str, lastmod: Option<&str>) -> SitemapEntry {
        SitemapEntry {
            loc: loc.into(),
            lastmod: lastmod.map(Into::into),
        }
    }

    #[test]
    fn parse_urlset_blocks() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:image="http://www.google.com/schemas/sitemap-image/1.1">
  <url>
    <loc>https://example.com/a</loc>
    <lastmod>2024-01-01</lastmod>
    <image:image><image:loc>https://example.com/a.png</image:loc></image:image>
  </url>
  <url>
    <lastmod>2024-01-02T10:00:00+00:00</lastmod>
    <loc> https://example.com/b?x=1&amp;y=2 </loc>
  </url>
  <url><loc>https://example.com/no-date</loc></url>
</urlset>"#;

        let doc = parse_sitemap(xml).unwrap();
        assert_eq!(
            doc,
            SitemapDocument::UrlSet(vec![
                entry("https://example.com/a", Some("2024-01-01")),
                entry("https://example.com/b?x=1&y=2", Some("2024-01-02T10:00:00+00:00")),
                entry("https://example.com/no-date", None),
            ])
        );
    }

    #[test]
    fn parse_flat_layout() {
        let xml = "<root>\
            <loc>https://example.com/a</loc><lastmod>2024-01-01</lastmod>\
            <loc>https://example.com/b</loc>\
            <loc>https://example.com/c</loc><priority>1</priority><lastmod>2024-03-01</lastmod>\
            </root>";

        let doc = parse_sitemap(xml).unwrap();
        assert_eq!(
            doc,
            SitemapDocument::UrlSet(vec![
                entry("https://example.com/a", Some("2024-01-01")),
                entry("https://example.com/b", None),
                entry("https://example.com/c", Some("2024-03-01")),
            ])
        );
    }

    #[test]
    fn parse_flat_layout_at_protocol_limit() {
        let mut xml = String::from("<root>");
        for i in 0..50_000 {
            xml.push_str(&format!(
                "<loc>https://example.com/p{i}</loc><lastmod>2024-01-{:02}</lastmod>",
                i % 28 + 1
            ));
        }
        xml.push_str("<loc>https://example.com/last</loc></root>");

        let started = std::time::Instant::now();
        let SitemapDocument::UrlSet(entries) = parse_sitemap(&xml).unwrap() else {
            panic!("expected a urlset");
        };
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(entries.len(), 50_001);
        assert_eq!(entries[0], entry("https://example.com/p0", Some("2024-01-01")));
        assert_eq!(
            entries[49_999],
            entry("https://example.com/p49999", Some("2024-01-20"))
        );
        assert_eq!(entries[50_000], entry("https://example.com/last", None));
    }

    #[test]
    fn parse_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.com/sitemap-0.xml</loc><lastmod>2024-01-01</lastmod></sitemap>
  <!-- <sitemap><loc>https://example.com/old.xml</loc></sitemap> -->
  <sitemap><loc><![CDATA[https://example.com/sitemap-1.xml]]></loc></sitemap>
</sitemapindex>"#;

        assert_eq!(
            parse_sitemap(xml).unwrap(),
            SitemapDocument::Index(vec![
                "https://example.com/sitemap-0.xml".into(),
                "https://example.com/sitemap-1.xml".into(),
            ])
        );
    }

    #[test]
    fn empty_urlset_is_valid() {
        let xml = r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"></urlset>"#;
        assert_eq!(parse_sitemap(xml).unwrap(), SitemapDocument::UrlSet(vec![]));
    }

    #[test]
    fn html_is_rejected() {
        assert!(parse_sitemap("<html><body>Not found</body></html>").is_err());
    }

    #[test]
    fn numeric_entities() {
        assert_eq!(clean_text("caf&#233;&#x2F;x"), "café/x");
        assert_eq!(clean_text("&bogus;"), "&bogus;");
    }
}
