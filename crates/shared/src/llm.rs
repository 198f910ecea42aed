//! LLM access: a provider client, a SQLite-backed judgment cache, and the
//! [`Judge`] that turns typed judgment requests into cached, retried calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{Credentials, LlmSettings, Provider};
use crate::error::JudgmentError;
use crate::text::content_hash;

/// Every kind of question the pipeline asks the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgmentKind {
    Significance,
    Classification,
    QuoteExtraction,
    PredictionGeneration,
    PredictionResolution,
    PredictionChange,
    Translation,
}

impl JudgmentKind {
    pub fn id(&self) -> &'static str {
        match self {
            JudgmentKind::Significance => "significance",
            JudgmentKind::Classification => "classification",
            JudgmentKind::QuoteExtraction => "quote_extraction",
            JudgmentKind::PredictionGeneration => "prediction_generation",
            JudgmentKind::PredictionResolution => "prediction_resolution",
            JudgmentKind::PredictionChange => "prediction_change",
            JudgmentKind::Translation => "translation",
        }
    }
}

/// A typed judgment request. The response is parsed into `Output` and cached
/// under `(KIND, sha256(cache_material))`.
pub trait JudgmentPrompt: Send + Sync {
    const KIND: JudgmentKind;
    type Output: Serialize + DeserializeOwned + Send;

    /// Everything the answer depends on. Two requests with equal material get
    /// the same cached answer.
    fn cache_material(&self) -> String;

    fn system(&self) -> String;

    fn prompt(&self) -> String;

    fn parse(&self, response: &str) -> Result<Self::Output, JudgmentError> {
        let json = extract_json(response)
            .ok_or_else(|| JudgmentError::Malformed(format!("no JSON object in: {}", preview(response))))?;
        serde_json::from_str(json).map_err(|e| JudgmentError::Malformed(e.to_string()))
    }
}

/// The outermost `{...}` span of an LLM answer, which is often wrapped in prose
/// or a code fence.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn preview(text: &str) -> &str {
    crate::text::truncate_chars(text.trim(), 120)
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the Anthropic Messages API or an OpenAI-compatible chat
/// completions endpoint (DeepSeek, OpenAI).
pub struct LlmClient {
    client: Client,
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let provider = settings.provider;
        Ok(Self {
            client,
            provider,
            api_key,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            max_tokens: settings.max_tokens,
        })
    }

    /// A client for the configured provider, or `None` when its key is missing.
    pub fn from_settings(settings: &LlmSettings, credentials: &Credentials) -> Result<Option<Self>> {
        match credentials.llm_key(settings.provider) {
            Some(key) => Ok(Some(Self::new(settings, key.to_string())?)),
            None => Ok(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete_anthropic(&self, system: &str, prompt: &str) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let response = check_status(response, "Anthropic").await?;
        let body = response
            .json::<AnthropicResponse>()
            .await
            .context("Failed to parse Anthropic API response")?;

        Ok(body
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn complete_chat(&self, system: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let response = check_status(response, "chat completion").await?;
        let body = response
            .json::<ChatResponse>()
            .await
            .context("Failed to parse chat completion response")?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Chat completion returned no content")
    }
}

async fn check_status(response: reqwest::Response, api: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("unknown error"));
    if status.as_u16() == 429 {
        anyhow::bail!("{} API rate_limit: {}", api, error_text);
    }
    anyhow::bail!("{} API error {}: {}", api, status, error_text);
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        match self.provider {
            Provider::Anthropic => self.complete_anthropic(system, prompt).await,
            Provider::Deepseek | Provider::Openai => self.complete_chat(system, prompt).await,
        }
    }
}

/// Parsed judgments keyed by `(kind, content_hash)`.
pub struct JudgmentCache {
    conn: Mutex<Connection>,
}

impl JudgmentCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open judgment cache {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory judgment cache")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS judgments (
                kind TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (kind, content_hash)
            )",
        )
        .context("Failed to create judgments table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, kind: JudgmentKind, hash: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("judgment cache lock poisoned"))?;
        conn.query_row(
            "SELECT response FROM judgments WHERE kind = ?1 AND content_hash = ?2",
            params![kind.id(), hash],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read judgment cache")
    }

    pub fn put(&self, kind: JudgmentKind, hash: &str, response: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("judgment cache lock poisoned"))?;
        conn.execute(
            "INSERT OR REPLACE INTO judgments (kind, content_hash, response) VALUES (?1, ?2, ?3)",
            params![kind.id(), hash, response],
        )
        .context("Failed to write judgment cache")?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("judgment cache lock poisoned"))?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM judgments", [], |row| row.get(0))
            .context("Failed to count judgments")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Dispatches typed judgments: cache first, then the backend under a
/// concurrency limit with per-call timeout and bounded retry.
pub struct Judge {
    backend: Option<Arc<dyn LlmBackend>>,
    cache: JudgmentCache,
    semaphore: Semaphore,
    call_timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
    rate_limit_backoff: Duration,
}

impl Judge {
    pub fn new(backend: Option<Arc<dyn LlmBackend>>, cache: JudgmentCache, settings: &LlmSettings) -> Self {
        Self {
            backend,
            cache,
            semaphore: Semaphore::new(settings.concurrency.max(1)),
            call_timeout: Duration::from_secs(settings.timeout_secs),
            max_attempts: settings.max_attempts.max(1),
            backoff: Duration::from_millis(settings.backoff_ms),
            rate_limit_backoff: Duration::from_secs(settings.rate_limit_backoff_secs),
        }
    }

    /// A judge that only answers from the cache.
    pub fn offline(cache: JudgmentCache) -> Self {
        Self::new(None, cache, &LlmSettings::default())
    }

    pub fn is_online(&self) -> bool {
        self.backend.is_some()
    }

    pub fn cache(&self) -> &JudgmentCache {
        &self.cache
    }

    pub async fn judge<P: JudgmentPrompt>(&self, request: &P) -> Result<P::Output, JudgmentError> {
        let kind = P::KIND;
        let hash = content_hash(&[kind.id(), &request.cache_material()]);

        match self.cache.get(kind, &hash) {
            Ok(Some(cached)) => match serde_json::from_str::<P::Output>(&cached) {
                Ok(output) => {
                    debug!(kind = kind.id(), "judgment cache hit");
                    return Ok(output);
                }
                Err(e) => warn!(kind = kind.id(), error = %e, "ignoring unreadable cached judgment"),
            },
            Ok(None) => {}
            Err(e) => warn!(kind = kind.id(), error = %e, "judgment cache unavailable"),
        }

        let backend = self.backend.as_ref().ok_or(JudgmentError::Unavailable)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| JudgmentError::Backend(e.into()))?;

        let system = request.system();
        let prompt = request.prompt();
        let mut last_error = JudgmentError::Unavailable;

        for attempt in 0..self.max_attempts {
            let error = match tokio::time::timeout(self.call_timeout, backend.complete(&system, &prompt)).await {
                Ok(Ok(text)) => match request.parse(&text) {
                    Ok(output) => {
                        match serde_json::to_string(&output) {
                            Ok(json) => {
                                if let Err(e) = self.cache.put(kind, &hash, &json) {
                                    warn!(kind = kind.id(), error = %e, "failed to cache judgment");
                                }
                            }
                            Err(e) => warn!(kind = kind.id(), error = %e, "failed to encode judgment"),
                        }
                        return Ok(output);
                    }
                    Err(e) => e,
                },
                Ok(Err(e)) => JudgmentError::Backend(e),
                Err(_) => JudgmentError::Timeout(self.call_timeout),
            };

            let is_rate_limit =
                matches!(&error, JudgmentError::Backend(e) if e.to_string().contains("rate_limit"));
            debug!(kind = kind.id(), attempt, error = %error, "judgment attempt failed");
            last_error = error;

            if attempt + 1 < self.max_attempts {
                // Longer backoff for rate limits
                let backoff = if is_rate_limit {
                    self.rate_limit_backoff.saturating_mul(attempt + 1)
                } else {
                    self.backoff.saturating_mul(2_u32.saturating_pow(attempt))
                };
                if is_rate_limit {
                    warn!(kind = kind.id(), ?backoff, "rate limit hit, backing off");
                }
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(kind = kind.id(), error = %last_error, "judgment failed after retries");
        Err(last_error)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that replays canned responses and counts calls. Once the script
    /// runs out, the last response repeats.
    pub struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<String, String>>>,
        last: Mutex<Option<Result<String, String>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn new(responses: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn always(response: &str) -> Arc<Self> {
            Self::new(vec![Ok(response)])
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            let response = match next {
                Some(r) => {
                    *self.last.lock().unwrap() = Some(r.clone());
                    r
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err("no scripted response".to_string())),
            };
            response.map_err(|e| anyhow::anyhow!(e))
        }
    }

    pub fn fast_settings() -> LlmSettings {
        LlmSettings {
            backoff_ms: 0,
            rate_limit_backoff_secs: 0,
            timeout_secs: 5,
            ..LlmSettings::default()
        }
    }

    pub fn judge_with(backend: Arc<ScriptedBackend>) -> Judge {
        Judge::new(
            Some(backend),
            JudgmentCache::in_memory().unwrap(),
            &fast_settings(),
        )
    }

    pub fn offline_judge() -> Judge {
        Judge::offline(JudgmentCache::in_memory().unwrap())
    }
}
