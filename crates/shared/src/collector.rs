//! Fetching raw payloads from configured sources.
//!
//! Feeds are parsed with `scraper` after renaming the few RSS/Atom tags that
//! HTML parsing would otherwise treat specially (`<link>` is void in HTML,
//! `<title>` is raw text) and unwrapping CDATA sections.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{CollectionSettings, SourceConfig, SourceKind};
use crate::models::RawPayload;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Raw items currently published by `source`. Filtering to the run's
    /// window happens in the normalizer.
    async fn collect(&self, source: &SourceConfig, run_date: NaiveDate) -> Result<Vec<RawPayload>>;
}

pub struct HttpCollector {
    client: Client,
    max_items: usize,
}

impl HttpCollector {
    pub fn new(settings: &CollectionSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.as_str())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_items: settings.max_items_per_source,
        })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..3u32 {
            match self.try_fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    debug!(url, attempt, error = %e, "fetch failed");
                    last_error = Some(e);
                    if attempt < 2 {
                        let backoff = Duration::from_millis(500 * 2_u64.pow(attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
    }

    async fn try_fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send HTTP request")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP error: {}", status);
        }

        response.text().await.context("Failed to read response body")
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn collect(&self, source: &SourceConfig, _run_date: NaiveDate) -> Result<Vec<RawPayload>> {
        let body = self.fetch(&source.url).await?;
        let mut payloads = match source.kind {
            SourceKind::Feed => parse_feed(&body, source)?,
            SourceKind::JsonFeed => parse_json_feed(&body, source)?,
            SourceKind::Html => parse_html_listing(&body, source)?,
        };
        payloads.truncate(self.max_items);
        Ok(payloads)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid selector {:?}: {}", css, e))
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Rewrite feed XML so an HTML parser keeps its structure.
fn prepare_feed_markup(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;
    while let Some(start) = rest.find("<![CDATA[") {
        out.push_str(&rest[..start]);
        let inner = &rest[start + 9..];
        match inner.find("]]>") {
            Some(end) => {
                out.push_str(&escape_text(&inner[..end]));
                rest = &inner[end + 3..];
            }
            None => {
                out.push_str(&escape_text(inner));
                rest = "";
            }
        }
    }
    out.push_str(rest);

    const RENAMES: &[(&str, &str)] = &[
        ("<link>", "<x-link>"),
        ("</link>", "</x-link>"),
        ("<title", "<x-title"),
        ("</title>", "</x-title>"),
        ("<source", "<x-source"),
        ("</source>", "</x-source>"),
        ("<content:encoded", "<x-encoded"),
        ("</content:encoded>", "</x-encoded>"),
        ("<dc:date", "<x-dcdate"),
        ("</dc:date>", "</x-dcdate>"),
        ("<dc:creator", "<x-creator"),
        ("</dc:creator>", "</x-creator>"),
        ("<media:content", "<x-media"),
        ("<media:thumbnail", "<x-media"),
    ];
    for (from, to) in RENAMES {
        out = out.replace(from, to);
    }
    out
}

fn first_text(element: ElementRef<'_>, selectors: &[&Selector]) -> Option<String> {
    selectors.iter().find_map(|s| {
        let text = element.select(s).next()?.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

/// RSS 2.0 `<item>`s or Atom `<entry>`s.
pub fn parse_feed(body: &str, source: &SourceConfig) -> Result<Vec<RawPayload>> {
    let document = Html::parse_document(&prepare_feed_markup(body));
    let item = selector("item, entry")?;
    let title = selector("x-title")?;
    let link_text = selector("x-link")?;
    let link_alternate = selector(r#"link[rel="alternate"][href]"#)?;
    let link_any = selector("link[href]")?;
    let guid = selector(r#"guid[ispermalink="true"], guid:not([ispermalink])"#)?;
    let published = selector("pubdate")?;
    let atom_published = selector("published")?;
    let atom_updated = selector("updated")?;
    let dc_date = selector("x-dcdate")?;
    let encoded = selector("x-encoded")?;
    let description = selector("description")?;
    let summary = selector("summary")?;
    let content = selector("content")?;
    let author = selector("x-creator")?;
    let author_name = selector("author name")?;
    let author_plain = selector("author")?;
    let enclosure = selector(r#"enclosure[type^="image"][url], x-media[url]"#)?;

    let mut payloads = Vec::new();
    for element in document.select(&item) {
        let url = first_text(element, &[&link_text])
            .or_else(|| {
                element
                    .select(&link_alternate)
                    .chain(element.select(&link_any))
                    .find_map(|l| l.value().attr("href").map(str::to_string))
            })
            .or_else(|| first_text(element, &[&guid]).filter(|g| g.starts_with("http")));

        payloads.push(RawPayload {
            source_name: source.name.clone(),
            source_region: source.region,
            language: source.language.clone(),
            title: first_text(element, &[&title]),
            url,
            published: first_text(element, &[&published, &atom_published, &atom_updated, &dc_date]),
            body: first_text(element, &[&encoded, &description, &content, &summary]),
            author: first_text(element, &[&author, &author_name, &author_plain]),
            image_urls: element
                .select(&enclosure)
                .filter_map(|e| e.value().attr("url").map(str::to_string))
                .collect(),
        });
    }

    if payloads.is_empty() && !body.contains("<item") && !body.contains("<entry") {
        anyhow::bail!("no RSS items or Atom entries found");
    }
    Ok(payloads)
}

#[derive(Deserialize)]
struct JsonFeed {
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Deserialize)]
struct JsonFeedItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    external_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content_html: Option<String>,
    #[serde(default)]
    content_text: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    date_published: Option<String>,
    #[serde(default)]
    date_modified: Option<String>,
    #[serde(default)]
    authors: Vec<JsonFeedAuthor>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Deserialize)]
struct JsonFeedAuthor {
    #[serde(default)]
    name: Option<String>,
}

pub fn parse_json_feed(body: &str, source: &SourceConfig) -> Result<Vec<RawPayload>> {
    let feed: JsonFeed = serde_json::from_str(body).context("Failed to parse JSON Feed")?;
    Ok(feed
        .items
        .into_iter()
        .map(|item| RawPayload {
            source_name: source.name.clone(),
            source_region: source.region,
            language: source.language.clone(),
            title: item.title,
            url: item.url.or(item.external_url),
            published: item.date_published.or(item.date_modified),
            body: item.content_html.or(item.content_text).or(item.summary),
            author: item.authors.into_iter().find_map(|a| a.name),
            image_urls: item.image.into_iter().collect(),
        })
        .collect())
}

/// A listing page scraped with the source's CSS selectors. Relative links are
/// resolved against the page URL.
pub fn parse_html_listing(body: &str, source: &SourceConfig) -> Result<Vec<RawPayload>> {
    let item_css = source
        .item_selector
        .as_deref()
        .context("html source needs item_selector")?;
    let link_css = source
        .link_selector
        .as_deref()
        .context("html source needs link_selector")?;

    let item = selector(item_css)?;
    let link = selector(link_css)?;
    let title = source.title_selector.as_deref().map(selector).transpose()?;
    let time = source.time_selector.as_deref().map(selector).transpose()?;
    let excerpt = source.excerpt_selector.as_deref().map(selector).transpose()?;
    let base = Url::parse(&source.url).ok();

    let document = Html::parse_document(body);
    let mut payloads = Vec::new();
    for element in document.select(&item) {
        let anchor = element.select(&link).next();
        let href = anchor.and_then(|a| a.value().attr("href"));
        let url = href.and_then(|h| match &base {
            Some(base) => base.join(h).ok().map(|u| u.to_string()),
            None => Some(h.to_string()),
        });

        let title_text = match &title {
            Some(s) => first_text(element, &[s]),
            None => anchor
                .map(|a| a.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty()),
        };
        let published = time.as_ref().and_then(|s| {
            let node = element.select(s).next()?;
            node.value()
                .attr("datetime")
                .map(str::to_string)
                .or_else(|| Some(node.text().collect::<String>().trim().to_string()))
                .filter(|t| !t.is_empty())
        });

        payloads.push(RawPayload {
            source_name: source.name.clone(),
            source_region: source.region,
            language: source.language.clone(),
            title: title_text,
            url,
            published,
            body: excerpt.as_ref().and_then(|s| first_text(element, &[s])),
            author: None,
            image_urls: Vec::new(),
        });
    }
    Ok(payloads)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source_name: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct CollectionReport {
    pub payloads: Vec<RawPayload>,
    pub succeeded: Vec<String>,
    pub failed: Vec<SourceFailure>,
}

impl CollectionReport {
    pub fn failed_source_names(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.source_name.clone()).collect()
    }
}

/// Collect every enabled source with at most `concurrency` in flight. A source
/// that errors or exceeds `timeout` is reported and left out; results are
/// merged in source order.
pub async fn collect_all(
    collector: &dyn Collector,
    sources: &[SourceConfig],
    run_date: NaiveDate,
    concurrency: usize,
    timeout: Duration,
) -> CollectionReport {
    let enabled: Vec<(usize, &SourceConfig)> = sources.iter().filter(|s| s.enabled).enumerate().collect();

    let mut results: Vec<(usize, &SourceConfig, Result<Vec<RawPayload>>)> = stream::iter(enabled)
        .map(|(i, source)| async move {
            let result = match tokio::time::timeout(timeout, collector.collect(source, run_date)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {}s", timeout.as_secs())),
            };
            (i, source, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _, _)| *i);

    let mut report = CollectionReport::default();
    for (_, source, result) in results {
        match result {
            Ok(payloads) => {
                debug!(source = %source.name, items = payloads.len(), "source collected");
                report.succeeded.push(source.name.clone());
                report.payloads.extend(payloads);
            }
            Err(e) => {
                warn!(source = %source.name, error = %e, "source failed, skipping");
                report.failed.push(SourceFailure {
                    source_name: source.name.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    info!(
        sources = report.succeeded.len() + report.failed.len(),
        failed = report.failed.len(),
        payloads = report.payloads.len(),
        "collection complete"
    );
    report
}
