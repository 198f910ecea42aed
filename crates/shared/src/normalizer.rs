//! Raw collector payloads to canonical [`Article`]s.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use html2text::render::text_renderer::TrivialDecorator;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use crate::models::{Article, RawPayload};
use crate::text;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "spm", "ref", "from"];

/// Canonical form of an article URL: lowercase scheme and host, no fragment,
/// no tracking parameters, no trailing slash. `None` for non-HTTP(S) or
/// unparseable input.
pub fn canonical_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_lowercase();
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = url.path().trim_end_matches('/');

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let query = if kept.is_empty() {
        String::new()
    } else {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        format!("?{}", encoded)
    };

    Some(format!("{}://{}{}{}{}", url.scheme(), host, port, path, query))
}

fn short_hash(parts: &[&str]) -> String {
    text::content_hash(parts)[..16].to_string()
}

/// Accepts RFC 3339, RFC 2822 and a few common naive layouts (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Body text from either HTML or plain text, whitespace collapsed.
pub fn body_text(body: &str) -> String {
    if body.contains('<') && body.contains('>') {
        let rendered = html2text::from_read_with_decorator(body.as_bytes(), 10_000, TrivialDecorator::new());
        text::collapse_whitespace(&rendered)
    } else {
        text::collapse_whitespace(body)
    }
}

/// Publication times accepted for one run: the run date in UTC, extended back
/// by `lookback_hours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CollectionWindow {
    pub fn for_run_date(run_date: NaiveDate, lookback_hours: i64) -> Self {
        let midnight = run_date.and_time(chrono::NaiveTime::MIN).and_utc();
        Self {
            start: midnight - Duration::hours(lookback_hours),
            end: midnight + Duration::days(1),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    MissingTitle,
    MissingUrl,
    MissingTimestamp,
    BadTimestamp { value: String },
    OutsideWindow { published_at: DateTime<Utc> },
    DuplicateUrl { kept_id: String },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::MissingTitle => write!(f, "missing title"),
            DropReason::MissingUrl => write!(f, "missing url"),
            DropReason::MissingTimestamp => write!(f, "missing timestamp"),
            DropReason::BadTimestamp { value } => write!(f, "unparseable timestamp {:?}", value),
            DropReason::OutsideWindow { published_at } => {
                write!(f, "published {} outside the collection window", published_at)
            }
            DropReason::DuplicateUrl { kept_id } => write!(f, "same url as article {}", kept_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedPayload {
    pub source_name: String,
    pub title: Option<String>,
    pub url: Option<String>,
    #[serde(flatten)]
    pub reason: DropReason,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub articles: Vec<Article>,
    pub dropped: Vec<DroppedPayload>,
}

pub struct Normalizer {
    excerpt_chars: usize,
    window: Option<CollectionWindow>,
    source_priority: Vec<String>,
}

impl Normalizer {
    pub fn new(excerpt_chars: usize, source_priority: Vec<String>) -> Self {
        Self {
            excerpt_chars,
            window: None,
            source_priority,
        }
    }

    pub fn with_window(mut self, window: CollectionWindow) -> Self {
        self.window = Some(window);
        self
    }

    fn priority_rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_priority.len())
    }

    pub fn normalize(&self, payloads: Vec<RawPayload>) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        let mut candidates: Vec<Article> = Vec::new();

        for payload in payloads {
            match self.normalize_one(&payload) {
                Ok(article) => candidates.push(article),
                Err(reason) => {
                    warn!(source = %payload.source_name, url = ?payload.url, %reason, "dropping payload");
                    report.dropped.push(DroppedPayload {
                        source_name: payload.source_name,
                        title: payload.title,
                        url: payload.url,
                        reason,
                    });
                }
            }
        }

        // Exact URL repeats: keep the earliest, then the higher-priority source.
        let mut winner: HashMap<String, usize> = HashMap::new();
        for (i, article) in candidates.iter().enumerate() {
            match winner.get(&article.id) {
                Some(&current) if !self.preferred(article, &candidates[current]) => {}
                _ => {
                    winner.insert(article.id.clone(), i);
                }
            }
        }

        for (i, article) in candidates.into_iter().enumerate() {
            if winner.get(&article.id) == Some(&i) {
                report.articles.push(article);
            } else {
                debug!(source = %article.source_name, url = %article.url, "dropping repeated url");
                report.dropped.push(DroppedPayload {
                    source_name: article.source_name,
                    title: Some(article.title),
                    url: Some(article.url),
                    reason: DropReason::DuplicateUrl {
                        kept_id: article.id,
                    },
                });
            }
        }

        info!(
            kept = report.articles.len(),
            dropped = report.dropped.len(),
            "normalization complete"
        );
        report
    }

    /// Whether `a` should replace `b` as the copy kept for a repeated URL.
    fn preferred(&self, a: &Article, b: &Article) -> bool {
        let key = |x: &Article| {
            (
                x.published_at,
                self.priority_rank(&x.source_name),
                x.source_name.clone(),
                x.title.clone(),
            )
        };
        key(a) < key(b)
    }

    fn normalize_one(&self, payload: &RawPayload) -> Result<Article, DropReason> {
        let title = payload
            .title
            .as_deref()
            .map(text::collapse_whitespace)
            .filter(|t| !t.is_empty())
            .ok_or(DropReason::MissingTitle)?;

        let raw_url = payload
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(DropReason::MissingUrl)?;

        let raw_time = payload
            .published
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(DropReason::MissingTimestamp)?;
        let published_at = parse_timestamp(raw_time).ok_or_else(|| DropReason::BadTimestamp {
            value: raw_time.to_string(),
        })?;

        if let Some(window) = &self.window {
            if !window.contains(published_at) {
                return Err(DropReason::OutsideWindow { published_at });
            }
        }

        let (id, url) = match canonical_url(raw_url) {
            Some(canonical) => (short_hash(&[&canonical]), canonical),
            None => (
                short_hash(&[&payload.source_name, &title, &published_at.to_rfc3339()]),
                raw_url.to_string(),
            ),
        };

        let body = payload.body.as_deref().map(body_text).unwrap_or_default();
        let excerpt = text::truncate_chars(&body, self.excerpt_chars).to_string();

        let language = if payload.language.trim().is_empty() {
            "en".to_string()
        } else {
            payload.language.trim().to_lowercase()
        };

        let mut article = Article::new(id, title, excerpt, payload.source_name.clone(), published_at, url);
        article.source_region = payload.source_region;
        article.language = language;
        article.author = payload
            .author
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        article.image_urls = payload.image_urls.clone();
        Ok(article)
    }
}
