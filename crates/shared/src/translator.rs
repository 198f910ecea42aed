use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::{Judge, JudgmentKind, JudgmentPrompt};
use crate::store::ArticleStore;

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source_language: &str, target_language: &str) -> Result<String>;
}

struct TranslationRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct TranslationOutput {
    translation: String,
}

fn language_name(code: &str) -> &str {
    match code {
        "zh" => "简体中文",
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "de" => "German",
        "fr" => "French",
        other => other,
    }
}

impl JudgmentPrompt for TranslationRequest<'_> {
    const KIND: JudgmentKind = JudgmentKind::Translation;
    type Output = TranslationOutput;

    fn cache_material(&self) -> String {
        format!("{}\n{}\n{}", self.source, self.target, self.text)
    }

    fn system(&self) -> String {
        "You are a professional technology news translator. Keep company, product and person names accurate. Answer only with JSON.".to_string()
    }

    fn prompt(&self) -> String {
        format!(
            "Translate from {} to {}:\n\n{}\n\nRespond as {{\"translation\": \"...\"}}",
            language_name(self.source),
            language_name(self.target),
            self.text
        )
    }
}

/// Translation through the LLM, sharing the judge's cache and retry policy.
pub struct LlmTranslator {
    judge: Arc<Judge>,
}

impl LlmTranslator {
    pub fn new(judge: Arc<Judge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(&self, text: &str, source_language: &str, target_language: &str) -> Result<String> {
        let request = TranslationRequest {
            text,
            source: source_language,
            target: target_language,
        };
        let output = self.judge.judge(&request).await?;
        let translation = output.translation.trim();
        if translation.is_empty() {
            anyhow::bail!("empty translation");
        }
        Ok(translation.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationReport {
    pub translated: usize,
    pub degraded: usize,
}

fn same_language(language: &str, target: &str) -> bool {
    let base = |code: &str| code.split(['-', '_']).next().unwrap_or("").to_lowercase();
    base(language) == base(target)
}

/// Fill `normalized_title`/`normalized_excerpt` for articles not already in
/// `target_language`. Without a translator, or when translation fails, the
/// original text stays and the article is flagged as degraded.
pub async fn translate_articles(
    store: &mut ArticleStore,
    translator: Option<&dyn Translator>,
    target_language: &str,
    concurrency: usize,
) -> TranslationReport {
    let pending: Vec<(String, String, String, String)> = store
        .iter()
        .filter(|a| !same_language(&a.language, target_language))
        .map(|a| (a.id.clone(), a.language.clone(), a.title.clone(), a.body_excerpt.clone()))
        .collect();

    let mut report = TranslationReport::default();
    if pending.is_empty() {
        return report;
    }

    let results: Vec<(String, Option<(String, String)>)> = stream::iter(pending)
        .map(|(id, language, title, excerpt)| async move {
            let Some(translator) = translator else {
                return (id, None);
            };
            let title = translator.translate(&title, &language, target_language).await;
            let excerpt = if excerpt.is_empty() {
                Ok(String::new())
            } else {
                translator.translate(&excerpt, &language, target_language).await
            };
            match (title, excerpt) {
                (Ok(t), Ok(e)) => (id, Some((t, e))),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(article = %id, error = %e, "translation failed, keeping original text");
                    (id, None)
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (id, translated) in results {
        let Some(article) = store.get(&id) else {
            continue;
        };
        let update = match translated {
            Some((title, excerpt)) => {
                report.translated += 1;
                (title, excerpt, false)
            }
            None => {
                report.degraded += 1;
                (article.title.clone(), article.body_excerpt.clone(), true)
            }
        };
        if let Err(e) = store.set_normalized_text(&id, update.0, update.1, update.2) {
            warn!(article = %id, error = %e, "could not store translation");
        }
    }

    info!(
        translated = report.translated,
        degraded = report.degraded,
        "translation complete"
    );
    report
}
