//! Remote document output. The local Markdown file is always written first;
//! publishing only mirrors it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Credentials, RemoteSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDocument {
    pub document_id: String,
    pub blocks: usize,
}

#[async_trait]
pub trait DocumentPublisher: Send + Sync {
    async fn publish(&self, title: &str, markdown: &str) -> Result<PublishedDocument>;
}

const BLOCK_TEXT: u8 = 2;
const BLOCK_HEADING1: u8 = 3;
const BLOCK_HEADING2: u8 = 4;
const BLOCK_HEADING3: u8 = 5;
const BLOCK_BULLET: u8 = 12;
const BLOCK_QUOTE: u8 = 15;
const BLOCKS_PER_REQUEST: usize = 50;

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn text_run(content: &str, bold: bool, italic: bool, link: Option<&str>) -> Value {
    let mut style = json!({});
    if bold {
        style["bold"] = json!(true);
    }
    if italic {
        style["italic"] = json!(true);
    }
    if let Some(url) = link {
        let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
        style["link"] = json!({ "url": encoded });
    }
    json!({ "text_run": { "content": content, "text_element_style": style } })
}

/// Split a Markdown line into text runs, turning `[text](url)` into links and
/// a line wrapped in `**`/`*` into bold/italic text.
fn inline_elements(line: &str) -> Vec<Value> {
    let (line, bold, italic) = if line.len() > 4 && line.starts_with("**") && line.ends_with("**") {
        (&line[2..line.len() - 2], true, false)
    } else if line.len() > 2 && line.starts_with('*') && line.ends_with('*') && !line.ends_with("\\*") {
        (&line[1..line.len() - 1], false, true)
    } else {
        (line, false, false)
    };

    let mut elements = Vec::new();
    let mut plain = String::new();
    let mut rest = line;
    while !rest.is_empty() {
        let link = rest.find('[').filter(|&i| i == 0 || !rest[..i].ends_with('\\'));
        let Some(open) = link else {
            plain.push_str(rest);
            break;
        };
        let parsed = rest[open..].find("](").and_then(|mid| {
            let text_end = open + mid;
            let url_start = text_end + 2;
            let url_end = url_start + rest[url_start..].find(')')?;
            Some((&rest[open + 1..text_end], &rest[url_start..url_end], url_end + 1))
        });
        match parsed {
            Some((text, url, consumed)) => {
                plain.push_str(&rest[..open]);
                if !plain.is_empty() {
                    elements.push(text_run(&unescape(&plain), bold, italic, None));
                    plain.clear();
                }
                elements.push(text_run(&unescape(text), bold, italic, Some(url)));
                rest = &rest[consumed..];
            }
            None => {
                plain.push_str(&rest[..=open]);
                rest = &rest[open + 1..];
            }
        }
    }
    if !plain.is_empty() {
        elements.push(text_run(&unescape(&plain), bold, italic, None));
    }
    elements
}

/// Docx blocks for the rendered briefing, one per non-empty line.
pub fn markdown_blocks(markdown: &str) -> Vec<Value> {
    markdown
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let trimmed = line.trim_start();
            let (block_type, key, body) = if let Some(b) = line.strip_prefix("### ") {
                (BLOCK_HEADING3, "heading3", b)
            } else if let Some(b) = line.strip_prefix("## ") {
                (BLOCK_HEADING2, "heading2", b)
            } else if let Some(b) = line.strip_prefix("# ") {
                (BLOCK_HEADING1, "heading1", b)
            } else if let Some(b) = trimmed.strip_prefix("- ") {
                (BLOCK_BULLET, "bullet", b)
            } else if let Some(b) = line.strip_prefix("> ") {
                (BLOCK_QUOTE, "quote", b)
            } else {
                (BLOCK_TEXT, "text", line)
            };
            json!({ "block_type": block_type, key: { "elements": inline_elements(body) } })
        })
        .collect()
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

/// Feishu (Lark) docx publisher: one new document per briefing.
pub struct FeishuPublisher {
    client: Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    folder_token: Option<String>,
}

impl FeishuPublisher {
    pub fn new(settings: &RemoteSettings, app_id: String, app_secret: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            folder_token: settings.folder_token.clone(),
        })
    }

    /// `None` when remote output is disabled or the app credentials are missing.
    pub fn from_settings(settings: &RemoteSettings, credentials: &Credentials) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        match credentials.feishu() {
            Some((id, secret)) => Ok(Some(Self::new(settings, id.to_string(), secret.to_string())?)),
            None => Ok(None),
        }
    }

    async fn tenant_token(&self) -> Result<String> {
        let response: TokenResponse = self
            .client
            .post(format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.base_url))
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await
            .context("Failed to request Feishu tenant token")?
            .json()
            .await
            .context("Failed to parse Feishu token response")?;

        if response.code != 0 {
            anyhow::bail!("Feishu token error {}: {}", response.code, response.msg);
        }
        Ok(response.tenant_access_token)
    }

    async fn post(&self, token: &str, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .context("Failed to send Feishu request")?;
        let status = response.status();
        let parsed: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Feishu response (HTTP {})", status))?;
        if parsed.code != 0 {
            anyhow::bail!("Feishu API error {}: {}", parsed.code, parsed.msg);
        }
        Ok(parsed.data)
    }

    async fn call(&self, token: &str, url: &str, body: Value) -> Result<Value> {
        let mut last_error = None;
        for attempt in 0..3u32 {
            match self.post(token, url, &body).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!(attempt, error = %e, "Feishu request failed");
                    last_error = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(Duration::from_millis(500 * 2_u64.pow(attempt))).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made")))
    }
}

#[async_trait]
impl DocumentPublisher for FeishuPublisher {
    async fn publish(&self, title: &str, markdown: &str) -> Result<PublishedDocument> {
        let token = self.tenant_token().await?;

        let mut create = json!({ "title": title });
        if let Some(folder) = &self.folder_token {
            create["folder_token"] = json!(folder);
        }
        let data = self
            .call(&token, &format!("{}/open-apis/docx/v1/documents", self.base_url), create)
            .await
            .context("Failed to create Feishu document")?;
        let document_id = data["document"]["document_id"]
            .as_str()
            .context("Feishu response has no document_id")?
            .to_string();

        let blocks = markdown_blocks(markdown);
        let url = format!(
            "{}/open-apis/docx/v1/documents/{id}/blocks/{id}/children",
            self.base_url,
            id = document_id
        );
        for chunk in blocks.chunks(BLOCKS_PER_REQUEST) {
            self.call(&token, &url, json!({ "children": chunk, "index": -1 }))
                .await
                .with_context(|| format!("Failed to append blocks to document {}", document_id))?;
        }

        info!(document_id = %document_id, blocks = blocks.len(), "briefing published to Feishu");
        Ok(PublishedDocument {
            document_id,
            blocks: blocks.len(),
        })
    }
}
