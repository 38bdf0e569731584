//! arXiv Atom API connector.
//!
//! Queries `GET {base_url}?search_query=...&start=...&max_results=...`
//! sorted by submission date (newest first) and parses the Atom feed with
//! `quick-xml`. With `fetch_full_text` enabled, each paper's PDF is
//! downloaded and run through [`extract_pdf`]; a failed download or
//! extraction leaves `full_text` empty so the abstract is indexed instead.
//!
//! Paper IDs drop the version suffix (`2401.00001v2` → `2401.00001`), so a
//! revised paper deduplicates against the version already stored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::extract::extract_pdf;
use crate::models::Paper;
use crate::sources::{PaperSource, SourceError, SourceQuery};

pub struct ArxivSource {
    client: reqwest::Client,
    base_url: String,
    fetch_full_text: bool,
    max_full_text_chars: usize,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl ArxivSource {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("paper-harness/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            fetch_full_text: config.fetch_full_text,
            max_full_text_chars: config.max_full_text_chars,
            request_delay: Duration::from_millis(config.request_delay_ms),
            last_request: Mutex::new(None),
        })
    }

    /// arXiv asks clients to space consecutive API calls.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn download_full_text(&self, pdf_url: &str) -> Option<String> {
        let response = match self.client.get(pdf_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(url = pdf_url, status = %r.status(), "PDF download failed");
                return None;
            }
            Err(e) => {
                warn!(url = pdf_url, error = %e, "PDF download failed");
                return None;
            }
        };
        let bytes = response.bytes().await.ok()?;
        let max_chars = self.max_full_text_chars;
        // pdf-extract is CPU-bound and synchronous.
        let extracted =
            tokio::task::spawn_blocking(move || extract_pdf(&bytes, max_chars)).await;
        match extracted {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!(url = pdf_url, error = %e, "falling back to abstract");
                None
            }
            Err(_) => None,
        }
    }
}

/// `cat:{category}` or `cat:{category} AND ({query})`.
pub fn search_query(category: &str, query: Option<&str>) -> String {
    match query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => format!("cat:{} AND ({})", category, q),
        None => format!("cat:{}", category),
    }
}

#[async_trait]
impl PaperSource for ArxivSource {
    fn name(&self) -> &str {
        "arxiv"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Paper>, SourceError> {
        let search = search_query(&query.category, query.query.as_deref());
        debug!(%search, start = query.start, max = query.max_results, "querying arXiv");
        self.throttle().await;

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", search.as_str()),
                ("start", &query.start.to_string()),
                ("max_results", &query.max_results.to_string()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Unreachable {
                url: self.base_url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| SourceError::Unreachable {
            url: self.base_url.clone(),
            message: e.to_string(),
        })?;

        let entries = parse_feed(&body, &query.category)?;
        let mut papers = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut paper = entry.paper;
            if self.fetch_full_text {
                if let Some(url) = entry.pdf_url.as_deref() {
                    paper.full_text = self.download_full_text(url).await.unwrap_or_default();
                }
            }
            papers.push(paper);
        }
        Ok(papers)
    }
}

/// One parsed `<entry>`.
#[derive(Debug)]
pub struct FeedEntry {
    pub paper: Paper,
    pub pdf_url: Option<String>,
}

#[derive(Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    author_name: String,
    category: Option<String>,
    abs_url: Option<String>,
    pdf_url: Option<String>,
}

impl EntryBuilder {
    fn on_element(&mut self, e: &BytesStart<'_>) -> Result<(), SourceError> {
        match e.local_name().as_ref() {
            b"link" => {
                let href = attr(e, b"href")?;
                let title = attr(e, b"title")?;
                let rel = attr(e, b"rel")?;
                match (title.as_deref(), rel.as_deref()) {
                    (Some("pdf"), _) => self.pdf_url = href,
                    (_, Some("alternate")) => self.abs_url = href,
                    _ => {}
                }
            }
            b"primary_category" => {
                if self.category.is_none() {
                    self.category = attr(e, b"term")?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self, fallback_category: &str) -> Result<FeedEntry, SourceError> {
        let doc_id = short_id(&self.id);
        let title = collapse(&self.title);
        if doc_id.is_empty() {
            return Err(SourceError::Parse("entry without <id>".to_string()));
        }
        if self.id.contains("/api/errors") {
            return Err(SourceError::Parse(format!(
                "arXiv rejected the query: {}",
                collapse(&self.summary)
            )));
        }
        let published = DateTime::parse_from_rfc3339(self.published.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc));

        Ok(FeedEntry {
            paper: Paper {
                doc_id,
                category: self
                    .category
                    .unwrap_or_else(|| fallback_category.to_string()),
                title,
                authors: self.authors,
                abstract_text: collapse(&self.summary),
                full_text: String::new(),
                published,
                source_url: self.abs_url.or_else(|| Some(self.id.trim().to_string())),
            },
            pdf_url: self.pdf_url,
        })
    }
}

/// Parses an arXiv Atom feed into entries. Entries carry the feed's
/// primary category, falling back to `category` when absent.
pub fn parse_feed(xml: &str, category: &str) -> Result<Vec<FeedEntry>, SourceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<EntryBuilder> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"entry" {
                    current = Some(EntryBuilder::default());
                } else if let Some(entry) = current.as_mut() {
                    entry.on_element(&e)?;
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    entry.on_element(&e)?;
                }
            }
            Ok(Event::Text(t)) => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| SourceError::Parse(e.to_string()))?;
                let parent = path.len().checked_sub(2).map(|i| path[i].as_slice());
                match (parent, path.last().map(Vec::as_slice)) {
                    (Some(b"entry"), Some(b"id")) => entry.id.push_str(&text),
                    (Some(b"entry"), Some(b"title")) => push_spaced(&mut entry.title, &text),
                    (Some(b"entry"), Some(b"summary")) => push_spaced(&mut entry.summary, &text),
                    (Some(b"entry"), Some(b"published")) => entry.published.push_str(&text),
                    (Some(b"author"), Some(b"name")) => push_spaced(&mut entry.author_name, &text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                path.pop();
                match e.local_name().as_ref() {
                    b"entry" => {
                        if let Some(entry) = current.take() {
                            entries.push(entry.finish(category)?);
                        }
                    }
                    b"author" => {
                        if let Some(entry) = current.as_mut() {
                            let name = collapse(&std::mem::take(&mut entry.author_name));
                            if !name.is_empty() {
                                entry.authors.push(name);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(e.to_string())),
            _ => {}
        }
    }

    Ok(entries)
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, SourceError> {
    match e.try_get_attribute(key) {
        Ok(Some(a)) => a
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| SourceError::Parse(e.to_string())),
        Ok(None) => Ok(None),
        Err(e) => Err(SourceError::Parse(e.to_string())),
    }
}

/// `http://arxiv.org/abs/2401.00001v2` → `2401.00001`.
fn short_id(entry_id: &str) -> String {
    let trimmed = entry_id.trim();
    let tail = trimmed
        .split_once("/abs/")
        .map(|(_, t)| t)
        .unwrap_or(trimmed);
    match tail.rfind('v') {
        Some(pos)
            if pos > 0
                && pos + 1 < tail.len()
                && tail[pos + 1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            tail[..pos].to_string()
        }
        _ => tail.to_string(),
    }
}

fn push_spaced(buf: &mut String, text: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(text);
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title type="html">ArXiv Query: search_query=cat:cs.CL</title>
  <id>http://arxiv.org/api/cHxbiOdZaP56ODnBPIenZhzg5f8</id>
  <entry>
    <id>http://arxiv.org/abs/2401.00001v2</id>
    <published>2024-01-02T18:59:59Z</published>
    <title>Attention Is Still
      All You Need</title>
    <summary>  We revisit self-attention &amp; show
  it scales.  </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2401.00001v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.00001v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/9901001v1</id>
    <published>1999-01-01T00:00:00Z</published>
    <title>Old Style Identifier</title>
    <summary>Strings.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parses_entries() {
        let entries = parse_feed(FEED, "cs.LG").unwrap();
        assert_eq!(entries.len(), 2);

        let first = &entries[0].paper;
        assert_eq!(first.doc_id, "2401.00001");
        assert_eq!(first.title, "Attention Is Still All You Need");
        assert_eq!(first.abstract_text, "We revisit self-attention & show it scales.");
        assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(first.category, "cs.CL");
        assert_eq!(first.source_url.as_deref(), Some("http://arxiv.org/abs/2401.00001v2"));
        assert_eq!(
            entries[0].pdf_url.as_deref(),
            Some("http://arxiv.org/pdf/2401.00001v2")
        );
        assert!(first.published.is_some());

        let second = &entries[1].paper;
        assert_eq!(second.doc_id, "hep-th/9901001");
        assert_eq!(second.category, "cs.LG");
        assert!(second.authors.is_empty());
    }

    #[test]
    fn test_empty_feed() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>empty</title></feed>"#;
        assert!(parse_feed(xml, "cs.CL").unwrap().is_empty());
    }

    #[test]
    fn test_error_entry_is_reported() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format</id>
            <title>Error</title>
            <summary>incorrect id format</summary>
        </entry></feed>"#;
        let err = parse_feed(xml, "cs.CL").unwrap_err();
        assert!(err.to_string().contains("incorrect id format"));
    }

    #[test]
    fn test_search_query() {
        assert_eq!(search_query("cs.CL", None), "cat:cs.CL");
        assert_eq!(search_query("cs.CL", Some("  ")), "cat:cs.CL");
        assert_eq!(
            search_query("cs.CL", Some("large language models")),
            "cat:cs.CL AND (large language models)"
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("http://arxiv.org/abs/2401.00001v12"), "2401.00001");
        assert_eq!(short_id("http://arxiv.org/abs/2401.00001"), "2401.00001");
        assert_eq!(short_id("http://arxiv.org/abs/solv-int/9901001v1"), "solv-int/9901001");
    }
}
