//! Statements by configured notable people.
//!
//! A mention needs both a name match (name or alias) and an attributable
//! statement: a quotation tied to the person by an attribution verb or colon,
//! or a reported-speech clause ("Huang said ..."). When a name matches but no
//! rule finds a statement, the LLM is asked to extract one.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PersonConfig;
use crate::error::JudgmentError;
use crate::llm::{Judge, JudgmentKind, JudgmentPrompt};
use crate::models::Article;
use crate::text;

pub(crate) const ATTRIBUTION_VERBS: &[&str] = &[
    "said", "says", "say", "told", "tells", "wrote", "writes", "stated", "argued", "argues",
    "predicted", "predicts", "warned", "warns", "added", "adds", "noted", "notes", "explained",
    "believes", "expects", "according to", "表示", "称", "认为", "指出", "透露", "预测", "说",
    "强调", "坦言", "提到",
];

const QUOTE_CONFIDENCE: f64 = 0.9;
const CLAUSE_CONFIDENCE: f64 = 0.6;
const LLM_CONFIDENCE: f64 = 0.5;
const MIN_STATEMENT_CHARS: usize = 4;

fn has_attribution(sentence: &str) -> bool {
    ATTRIBUTION_VERBS.iter().any(|v| text::contains_term(sentence, v))
}

fn has_colon_intro(sentence: &str) -> bool {
    sentence.contains(':') || sentence.contains('：')
}

/// Sentence text with every quoted span removed.
fn outside_quotes(sentence: &str) -> String {
    let mut rest = sentence.to_string();
    for span in text::quoted_spans(sentence) {
        rest = rest.replacen(span, " ", 1);
    }
    rest
}

/// Names of whoever is quoted in `text`: Latin proper names outside the
/// quotation marks, and the characters right before a CJK attribution verb.
pub(crate) fn attributed_speakers(text: &str) -> BTreeSet<String> {
    let mut speakers = BTreeSet::new();
    for sentence in text::sentences(text) {
        if text::quoted_spans(sentence).is_empty() || !has_attribution(sentence) {
            continue;
        }
        let outside = outside_quotes(sentence);
        speakers.extend(text::named_terms(&outside));

        for verb in ATTRIBUTION_VERBS.iter().filter(|v| v.chars().any(text::is_cjk)) {
            if let Some(pos) = outside.find(verb) {
                let name: String = outside[..pos]
                    .chars()
                    .rev()
                    .take_while(|c| text::is_cjk(*c))
                    .take(3)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                if name.chars().count() >= 2 {
                    speakers.insert(name);
                }
            }
        }
    }
    speakers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionMethod {
    Quote,
    Clause,
    Llm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPersonMention {
    pub person_id: String,
    pub person_name: String,
    pub article_id: String,
    pub quote_text: String,
    pub confidence: f64,
    pub method: MentionMethod,
}

/// Ask for a statement by a named person in an article.
pub struct QuoteExtractionRequest {
    pub person_name: String,
    pub aliases: Vec<String>,
    pub organization: Option<String>,
    pub article_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedQuote {
    /// `None` when the article reports no statement by the person.
    pub quote: Option<String>,
}

impl JudgmentPrompt for QuoteExtractionRequest {
    const KIND: JudgmentKind = JudgmentKind::QuoteExtraction;
    type Output = ExtractedQuote;

    fn cache_material(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.person_name,
            self.aliases.join("|"),
            self.article_text
        )
    }

    fn system(&self) -> String {
        "You extract attributable statements from news articles. Answer only with JSON.".to_string()
    }

    fn prompt(&self) -> String {
        let org = self
            .organization
            .as_deref()
            .map(|o| format!(" ({})", o))
            .unwrap_or_default();
        format!(
            r#"Person: {name}{org}, also written as: {aliases}

Article:
{text}

Does the article attribute a statement, opinion or forecast to this person?
Only use text from the article. If it does not, use null.

Respond as: {{"quote": "the statement" | null}}"#,
            name = self.person_name,
            org = org,
            aliases = self.aliases.join(", "),
            text = self.article_text,
        )
    }
}

pub struct KeyPersonExtractor {
    people: Vec<PersonConfig>,
    judge: Arc<Judge>,
    concurrency: usize,
}

impl KeyPersonExtractor {
    pub fn new(people: Vec<PersonConfig>, judge: Arc<Judge>) -> Self {
        Self {
            people,
            judge,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn names(person: &PersonConfig) -> impl Iterator<Item = &str> {
        std::iter::once(person.name.as_str()).chain(person.aliases.iter().map(String::as_str))
    }

    fn mentions_person(person: &PersonConfig, text: &str) -> bool {
        Self::names(person).any(|n| text::contains_term(text, n))
    }

    /// Statements found by the quotation and clause rules.
    pub fn rule_statements(&self, person: &PersonConfig, article_text: &str) -> Vec<(String, f64, MentionMethod)> {
        let mut found = Vec::new();
        for sentence in text::sentences(article_text) {
            if !Self::mentions_person(person, sentence) {
                continue;
            }

            let spans = text::quoted_spans(sentence);
            if !spans.is_empty() {
                let outside = outside_quotes(sentence);
                let attributed = Self::mentions_person(person, &outside)
                    && (has_attribution(&outside) || has_colon_intro(&outside));
                if attributed {
                    for span in spans {
                        if span.chars().count() >= MIN_STATEMENT_CHARS {
                            found.push((span.to_string(), QUOTE_CONFIDENCE, MentionMethod::Quote));
                        }
                    }
                }
                continue;
            }

            if let Some(statement) = Self::reported_clause(person, sentence) {
                found.push((statement, CLAUSE_CONFIDENCE, MentionMethod::Clause));
            }
        }
        found
    }

    /// "Huang said demand ...", "雷军表示，..." and "According to Musk, ...".
    fn reported_clause(person: &PersonConfig, sentence: &str) -> Option<String> {
        if let Some(rest) = text::strip_prefix_ignore_case(sentence, "according to ") {
            if Self::names(person).any(|n| text::contains_term(rest.split(',').next().unwrap_or(""), n)) {
                let comma = sentence.find(',')?;
                return Self::clean_statement(&sentence[comma + 1..]);
            }
        }

        for name in Self::names(person) {
            let Some(found) = text::find_term_range(sentence, name) else {
                continue;
            };
            let rest = &sentence[found.end..];
            // Allow a short appositive: "Huang, Nvidia's chief executive, said".
            let window_end = rest.char_indices().nth(48).map(|(i, _)| i).unwrap_or(rest.len());
            let window = &rest[..window_end];
            for verb in ATTRIBUTION_VERBS {
                if *verb == "according to" {
                    continue;
                }
                if let Some(v) = text::find_term_range(window, verb) {
                    return Self::clean_statement(&rest[v.end..]);
                }
            }
        }
        None
    }

    fn clean_statement(raw: &str) -> Option<String> {
        let trimmed = raw
            .trim()
            .trim_start_matches([',', ':', '，', '：', ' '])
            .trim_start_matches("that ")
            .trim();
        (trimmed.chars().count() >= MIN_STATEMENT_CHARS).then(|| trimmed.to_string())
    }

    /// All mentions across `articles`, ordered by article, then registry order.
    pub async fn extract(&self, articles: &[&Article]) -> Vec<KeyPersonMention> {
        let mut mentions: Vec<(usize, usize, KeyPersonMention)> = Vec::new();
        let mut fallbacks: Vec<(usize, usize, QuoteExtractionRequest)> = Vec::new();

        for (ai, article) in articles.iter().enumerate() {
            let body = article.searchable_text();
            for (pi, person) in self.people.iter().enumerate() {
                if !Self::mentions_person(person, &body) {
                    continue;
                }
                let statements = self.rule_statements(person, &body);
                if statements.is_empty() {
                    fallbacks.push((
                        ai,
                        pi,
                        QuoteExtractionRequest {
                            person_name: person.name.clone(),
                            aliases: person.aliases.clone(),
                            organization: person.organization.clone(),
                            article_text: body.clone(),
                        },
                    ));
                    continue;
                }
                for (quote, confidence, method) in statements {
                    mentions.push((ai, pi, self.mention(person, article, quote, confidence, method)));
                }
            }
        }

        let extracted: Vec<(usize, usize, Option<String>)> = stream::iter(fallbacks)
            .map(|(ai, pi, request)| async move {
                match self.judge.judge(&request).await {
                    Ok(output) => (ai, pi, output.quote),
                    Err(JudgmentError::Unavailable) => {
                        debug!(person = %request.person_name, "no LLM for quote extraction, skipping");
                        (ai, pi, None)
                    }
                    Err(e) => {
                        warn!(person = %request.person_name, error = %e, "quote extraction failed, no mention recorded");
                        (ai, pi, None)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (ai, pi, quote) in extracted {
            let Some(quote) = quote.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()) else {
                continue;
            };
            let person = &self.people[pi];
            mentions.push((
                ai,
                pi,
                self.mention(person, articles[ai], quote, LLM_CONFIDENCE, MentionMethod::Llm),
            ));
        }

        mentions.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, _, mention) in mentions {
            let key = (
                mention.person_id.clone(),
                mention.article_id.clone(),
                text::collapse_whitespace(&mention.quote_text).to_lowercase(),
            );
            if seen.insert(key) {
                out.push(mention);
            }
        }

        if out.is_empty() {
            debug!("no key-person statements found");
        } else {
            info!(mentions = out.len(), "key-person statements extracted");
        }
        out
    }

    fn mention(
        &self,
        person: &PersonConfig,
        article: &Article,
        quote: String,
        confidence: f64,
        method: MentionMethod,
    ) -> KeyPersonMention {
        debug!(person = %person.id, article = %article.id, ?method, "statement found");
        KeyPersonMention {
            person_id: person.id.clone(),
            person_name: person.name.clone(),
            article_id: article.id.clone(),
            quote_text: quote,
            confidence,
            method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::*;
    use chrono::Utc;

    fn huang() -> PersonConfig {
        PersonConfig::new("jensen-huang", "Jensen Huang", &["黄仁勋", "Huang"], Some("Nvidia"))
    }

    fn extractor(judge: Judge) -> KeyPersonExtractor {
        KeyPersonExtractor::new(vec![huang()], Arc::new(judge))
    }

    fn article(id: &str, title: &str, body: &str) -> Article {
        Article::new(id, title, body, "src", Utc::now(), format!("https://x.test/{}", id))
    }

    #[test]
    fn test_quote_with_attribution_verb() {
        let e = extractor(offline_judge());
        let found = e.rule_statements(&huang(), "Huang said \"demand for Blackwell is insane\" on Monday.");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "demand for Blackwell is insane");
        assert_eq!(found[0].2, MentionMethod::Quote);
    }

    #[test]
    fn test_cjk_quote_with_colon() {
        let e = extractor(offline_judge());
        let found = e.rule_statements(&huang(), "黄仁勋：“AI工厂是新的工业革命。”");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "AI工厂是新的工业革命。");
    }

    #[test]
    fn test_reported_clause_with_appositive() {
        let e = extractor(offline_judge());
        let found = e.rule_statements(
            &huang(),
            "Jensen Huang, Nvidia's chief executive, said that supply will stay tight through 2026.",
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "supply will stay tight through 2026.");
        assert_eq!(found[0].2, MentionMethod::Clause);
    }

    #[test]
    fn test_reported_clause_after_case_changing_letters() {
        let e = extractor(offline_judge());
        let found = e.rule_statements(
            &huang(),
            "At the İSTANBUL summit Huang said demand for Blackwell stays strong through 2026.",
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "demand for Blackwell stays strong through 2026.");
    }

    #[test]
    fn test_name_without_statement_is_not_a_mention() {
        let e = extractor(offline_judge());
        assert!(e
            .rule_statements(&huang(), "Nvidia, led by Jensen Huang, posted record revenue.")
            .is_empty());
    }

    #[test]
    fn test_quote_attributed_to_someone_else_is_skipped() {
        let e = extractor(offline_judge());
        let found = e.rule_statements(&huang(), "Analyst Ming-Chi Kuo said \"Huang's chips are sold out\".");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_extract_falls_back_to_llm_when_rules_find_nothing() {
        let backend = ScriptedBackend::always(r#"{"quote": "Nvidia will keep investing in China"}"#);
        let e = extractor(judge_with(backend.clone()));
        let a = article("a1", "Huang visits Beijing", "Jensen Huang met suppliers and reaffirmed commitments.");
        let b = article("b1", "Unrelated", "Nothing about anyone.");
        let mentions = e.extract(&[&a, &b]).await;
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].method, MentionMethod::Llm);
        assert_eq!(mentions[0].article_id, "a1");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_extract_offline_drops_unattributed_names() {
        let e = extractor(offline_judge());
        let a = article("a1", "Huang visits Beijing", "Jensen Huang met suppliers.");
        assert!(e.extract(&[&a]).await.is_empty());
    }

    #[tokio::test]
    async fn test_extract_dedupes_repeated_quotes() {
        let e = extractor(offline_judge());
        let mut a = article(
            "a1",
            "Huang on AI",
            "Huang said \"AI is the new electricity\". Later Huang repeated \"AI is the new electricity\".",
        );
        a.normalized_title = "黄仁勋谈AI".to_string();
        let mentions = e.extract(&[&a]).await;
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].confidence, QUOTE_CONFIDENCE);
    }

    #[test]
    fn test_attributed_speakers() {
        let s = attributed_speakers("Lisa Su said \"MI400 ships next year\". 雷军表示“小米汽车交付提速”。");
        assert!(s.contains("lisa"));
        assert!(s.contains("su"));
        assert!(s.contains("雷军"));
    }
}
