use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::storage::ParsedArticle;

/// Entries from one feed document.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    /// Feed title, if the document has one
    pub title: Option<String>,
    pub articles: Vec<ParsedArticle>,
    /// Entries dropped for lacking a usable http(s) link
    pub skipped: usize,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParseResult> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());

    let mut skipped = 0;
    let articles: Vec<ParsedArticle> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let Some(link) = entry
                .links
                .iter()
                .map(|l| l.href.trim())
                .find(|href| is_http_link(href))
                .map(str::to_string)
            else {
                skipped += 1;
                return None;
            };

            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(existing_id, &link, &title, published);

            Some(ParsedArticle {
                guid,
                title,
                link,
                published,
            })
        })
        .collect();

    Ok(ParseResult {
        title,
        articles,
        skipped,
    })
}

fn is_http_link(href: &str) -> bool {
    url::Url::parse(href)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

fn generate_guid(existing: Option<&str>, link: &str, title: &str, published: Option<i64>) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link,
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_rss_entries() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Top stories</title>
    <item>
        <guid>story-1</guid>
        <title>First</title>
        <link>https://news.example/rss/articles/CBMabc</link>
        <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
    </item>
    <item>
        <guid>story-2</guid>
        <title>Second</title>
        <link>https://news.example/rss/articles/AUxyz</link>
    </item>
</channel></rss>"#;

        let result = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(result.title.as_deref(), Some("Top stories"));
        assert_eq!(result.skipped, 0);
        assert_eq!(result.articles.len(), 2);
        assert_eq!(
            result.articles[0],
            ParsedArticle {
                guid: "story-1".into(),
                title: "First".into(),
                link: "https://news.example/rss/articles/CBMabc".into(),
                published: Some(1704067200),
            }
        );
    }

    #[test]
    fn test_entries_without_http_link_skipped() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>No link</title></item>
    <item><guid>2</guid><title>Bad scheme</title><link>ftp://files.example/a</link></item>
    <item><guid>3</guid><title>Good</title><link>https://news.example/r/3</link></item>
</channel></rss>"#;

        let result = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(result.skipped, 2);
        assert_eq!(result.articles.len(), 1);
        assert_eq!(result.articles[0].guid, "3");
    }

    #[test]
    fn test_generated_guid_is_stable() {
        let a = generate_guid(None, "https://news.example/r/1", "Title", Some(1));
        let b = generate_guid(Some("  "), "https://news.example/r/1", "Title", Some(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_guid(None, "https://news.example/r/2", "Title", Some(1)));
    }

    #[test]
    fn test_invalid_xml_is_error() {
        assert!(parse_feed(b"<not valid xml").is_err());
    }
}
