//! Twelve-way topic classification.
//!
//! Keyword rules decide when one category clearly wins; otherwise the LLM is
//! asked, and its answer is cached by content hash so reruns over the same text
//! give the same result.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ClassifierSettings;
use crate::error::JudgmentError;
use crate::llm::{Judge, JudgmentKind, JudgmentPrompt};
use crate::models::{Article, Category};
use crate::resolver::EventCluster;
use crate::store::ArticleStore;
use crate::text;

const TITLE_WEIGHT: u32 = 2;
const EXCERPT_WEIGHT: u32 = 1;
const LLM_CONFIDENCE: f64 = 0.7;
const FALLBACK_CONFIDENCE: f64 = 0.3;

fn default_keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::Ai => &[
            "ai", "artificial intelligence", "llm", "chatbot", "openai", "chatgpt", "gpt", "claude",
            "gemini", "deepseek", "ai agent", "ai agents", "copilot", "ai model", "ai models",
            "language model", "foundation model", "人工智能", "大模型", "智能体", "生成式", "AI编程",
        ],
        Category::Robotics => &[
            "robot", "robots", "robotics", "humanoid", "drone", "drones", "机器人", "人形机器人",
            "机械臂", "无人机",
        ],
        Category::EmbodiedAi => &[
            "embodied", "smart glasses", "ai glasses", "wearable", "wearables", "headset",
            "vision pro", "具身智能", "智能眼镜", "AI眼镜", "可穿戴",
        ],
        Category::Semiconductor => &[
            "chip", "chips", "chipmaker", "semiconductor", "semiconductors", "tsmc", "foundry", "wafer",
            "gpu", "gpus", "hbm", "euv", "nvidia", "asml", "芯片", "半导体", "晶圆", "光刻机",
            "存储芯片", "制程",
        ],
        Category::Auto => &[
            "ev", "evs", "electric vehicle", "tesla", "byd", "autonomous driving", "self-driving",
            "robotaxi", "automaker", "car", "cars", "汽车", "电动车", "新能源车", "自动驾驶",
            "智驾", "车企",
        ],
        Category::Health => &[
            "health", "medical", "biotech", "drug", "fda", "pharma", "hospital", "clinical",
            "医疗", "医药", "生物科技", "药物", "临床",
        ],
        Category::Economy => &[
            "economy", "gdp", "inflation", "tariff", "tariffs", "trade", "central bank",
            "interest rate", "经济", "关税", "贸易", "央行", "通胀", "产业政策",
        ],
        Category::Business => &[
            "acquisition", "acquire", "merger", "layoffs", "layoff", "revenue", "earnings", "ceo",
            "startup", "partnership", "收购", "并购", "裁员", "营收", "财报", "合作",
        ],
        Category::Politics => &[
            "regulation", "regulators", "antitrust", "congress", "senate", "ban on", "sanctions",
            "export controls", "european commission", "white house", "监管", "反垄断", "制裁", "出口管制", "立法",
        ],
        Category::Investment => &[
            "ipo", "funding", "funding round", "valuation", "venture capital", "share price", "stock",
            "stocks", "investors", "series a", "series b", "series c", "融资", "估值", "上市", "股价", "投资", "美股", "港股",
        ],
        Category::ConsumerElectronics => &[
            "iphone", "smartphone", "smartphones", "phone", "laptop", "tablet", "ipad", "macbook",
            "smart home", "xiaomi", "samsung", "手机", "笔记本", "平板", "智能家居", "消费电子",
        ],
        Category::KeyPeople => &["interview", "keynote", "专访", "演讲", "访谈"],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    /// Keyword rules were conclusive.
    Rules,
    Llm,
    /// Rules were inconclusive and the LLM failed; the best rule category was used.
    RuleFallback,
    /// Nothing matched and the LLM could not decide.
    Uncategorized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub article_id: String,
    /// `None` means the uncategorized bucket.
    pub category: Option<Category>,
    pub method: ClassificationMethod,
    pub confidence: f64,
}

/// Categories for a resolved cluster. Placement uses `primary`, the
/// representative's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterClassification {
    pub cluster_id: String,
    pub primary: Option<Category>,
    pub categories: BTreeSet<Category>,
    /// One entry per retained member, representative first.
    pub members: Vec<Classification>,
}

/// Rule scores for one article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleScores {
    /// Non-zero scores in category order.
    pub scores: Vec<(Category, u32)>,
}

impl RuleScores {
    /// Highest score; ties go to the earlier category.
    pub fn best(&self) -> Option<(Category, u32)> {
        self.scores
            .iter()
            .copied()
            .fold(None, |best: Option<(Category, u32)>, (c, s)| match best {
                Some((_, bs)) if bs >= s => best,
                _ => Some((c, s)),
            })
    }

    pub fn margin(&self) -> u32 {
        let Some((best_category, best)) = self.best() else {
            return 0;
        };
        let runner_up = self
            .scores
            .iter()
            .filter(|(c, _)| *c != best_category)
            .map(|(_, s)| *s)
            .max()
            .unwrap_or(0);
        best - runner_up
    }
}

pub struct ClassificationRequest {
    pub title: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationJudgment {
    pub category: String,
}

impl JudgmentPrompt for ClassificationRequest {
    const KIND: JudgmentKind = JudgmentKind::Classification;
    type Output = ClassificationJudgment;

    fn cache_material(&self) -> String {
        let ids: Vec<&str> = Category::ALL.iter().map(|c| c.id()).collect();
        format!("{}\n{}\n{}", ids.join(","), self.title, self.excerpt)
    }

    fn system(&self) -> String {
        "You classify technology news into a fixed taxonomy. Answer only with JSON.".to_string()
    }

    fn prompt(&self) -> String {
        let taxonomy: Vec<String> = Category::ALL
            .iter()
            .map(|c| format!("- {}: {}", c.id(), c.scope()))
            .collect();
        format!(
            r#"Categories:
{taxonomy}

Article:
{title}
{excerpt}

Pick the single category that fits the article's main subject.

Respond as: {{"category": "<category id>"}}"#,
            taxonomy = taxonomy.join("\n"),
            title = self.title,
            excerpt = self.excerpt,
        )
    }
}

pub struct Classifier {
    keywords: Vec<(Category, Vec<String>)>,
    min_score: u32,
    min_margin: u32,
    judge: Arc<Judge>,
    concurrency: usize,
}

impl Classifier {
    pub fn new(settings: &ClassifierSettings, judge: Arc<Judge>) -> Self {
        let keywords = Category::ALL
            .iter()
            .map(|&category| {
                let mut words: Vec<String> = if settings.extend_defaults {
                    default_keywords(category).iter().map(|w| w.to_string()).collect()
                } else {
                    Vec::new()
                };
                if let Some(extra) = settings.keywords.get(&category) {
                    for word in extra {
                        if !words.iter().any(|w| w.eq_ignore_ascii_case(word)) {
                            words.push(word.clone());
                        }
                    }
                }
                (category, words)
            })
            .collect();

        Self {
            keywords,
            min_score: settings.min_score,
            min_margin: settings.min_margin,
            judge,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Title hits count double. Both the original and normalized text are searched.
    pub fn rule_scores(&self, article: &Article) -> RuleScores {
        let title = if article.normalized_title == article.title {
            article.title.clone()
        } else {
            format!("{}\n{}", article.title, article.normalized_title)
        };
        let excerpt = if article.normalized_excerpt == article.body_excerpt {
            article.body_excerpt.clone()
        } else {
            format!("{}\n{}", article.body_excerpt, article.normalized_excerpt)
        };

        let scores = self
            .keywords
            .iter()
            .filter_map(|(category, words)| {
                let score: u32 = words
                    .iter()
                    .map(|w| {
                        let mut s = 0;
                        if text::contains_term(&title, w) {
                            s += TITLE_WEIGHT;
                        }
                        if text::contains_term(&excerpt, w) {
                            s += EXCERPT_WEIGHT;
                        }
                        s
                    })
                    .sum();
                (score > 0).then_some((*category, score))
            })
            .collect();
        RuleScores { scores }
    }

    fn confident(&self, scores: &RuleScores) -> Option<(Category, u32)> {
        let best = scores.best()?;
        (best.1 >= self.min_score && scores.margin() >= self.min_margin).then_some(best)
    }

    pub async fn classify(&self, article: &Article) -> Classification {
        let scores = self.rule_scores(article);
        if let Some((category, score)) = self.confident(&scores) {
            let total: u32 = scores.scores.iter().map(|(_, s)| s).sum();
            return Classification {
                article_id: article.id.clone(),
                category: Some(category),
                method: ClassificationMethod::Rules,
                confidence: score as f64 / total as f64,
            };
        }

        let request = ClassificationRequest {
            title: article.normalized_title.clone(),
            excerpt: article.normalized_excerpt.clone(),
        };
        let failure = match self.judge.judge(&request).await {
            Ok(judgment) => match Category::from_id(&judgment.category) {
                Some(category) => {
                    return Classification {
                        article_id: article.id.clone(),
                        category: Some(category),
                        method: ClassificationMethod::Llm,
                        confidence: LLM_CONFIDENCE,
                    };
                }
                None => format!("unknown category {:?}", judgment.category),
            },
            Err(JudgmentError::Unavailable) => "no LLM available".to_string(),
            Err(e) => e.to_string(),
        };

        match scores.best() {
            Some((category, _)) => {
                debug!(article = %article.id, reason = %failure, category = category.id(), "using best rule category");
                Classification {
                    article_id: article.id.clone(),
                    category: Some(category),
                    method: ClassificationMethod::RuleFallback,
                    confidence: FALLBACK_CONFIDENCE,
                }
            }
            None => {
                warn!(article = %article.id, reason = %failure, "article left uncategorized");
                Classification {
                    article_id: article.id.clone(),
                    category: None,
                    method: ClassificationMethod::Uncategorized,
                    confidence: 0.0,
                }
            }
        }
    }

    /// Classify every retained member of every cluster.
    pub async fn classify_clusters(&self, clusters: &[EventCluster], store: &ArticleStore) -> Vec<ClusterClassification> {
        let articles: Vec<&Article> = clusters
            .iter()
            .flat_map(|c| c.retained_member_ids.iter())
            .filter_map(|id| store.get(id))
            .collect();

        let by_id: BTreeMap<String, Classification> = stream::iter(articles)
            .map(|article| async move { self.classify(article).await })
            .buffer_unordered(self.concurrency)
            .map(|c| (c.article_id.clone(), c))
            .collect()
            .await;

        let result: Vec<ClusterClassification> = clusters
            .iter()
            .map(|cluster| {
                let members: Vec<Classification> = cluster
                    .retained_member_ids
                    .iter()
                    .filter_map(|id| by_id.get(id).cloned())
                    .collect();
                let primary = by_id
                    .get(&cluster.representative_article_id)
                    .and_then(|c| c.category);
                ClusterClassification {
                    cluster_id: cluster.cluster_id.clone(),
                    primary,
                    categories: members.iter().filter_map(|c| c.category).collect(),
                    members,
                }
            })
            .collect();

        let mut methods: BTreeMap<&str, usize> = BTreeMap::new();
        for c in by_id.values() {
            let key = match c.method {
                ClassificationMethod::Rules => "rules",
                ClassificationMethod::Llm => "llm",
                ClassificationMethod::RuleFallback => "rule_fallback",
                ClassificationMethod::Uncategorized => "uncategorized",
            };
            *methods.entry(key).or_default() += 1;
        }
        info!(
            clusters = result.len(),
            articles = by_id.len(),
            rules = methods.get("rules").copied().unwrap_or(0),
            llm = methods.get("llm").copied().unwrap_or(0),
            rule_fallback = methods.get("rule_fallback").copied().unwrap_or(0),
            uncategorized = methods.get("uncategorized").copied().unwrap_or(0),
            "classification complete"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::*;
    use chrono::Utc;

    fn article(id: &str, title: &str, excerpt: &str) -> Article {
        Article::new(id, title, excerpt, "TC", Utc::now(), format!("https://x.test/{}", id))
    }

    fn classifier(judge: Judge) -> Classifier {
        Classifier::new(&ClassifierSettings::default(), Arc::new(judge))
    }

    #[test]
    fn test_rule_scores_weight_title_hits() {
        let c = classifier(offline_judge());
        let scores = c.rule_scores(&article("a", "TSMC expands chip output", "The foundry adds a wafer line."));
        let (best, score) = scores.best().unwrap();
        assert_eq!(best, Category::Semiconductor);
        // tsmc(2) + chip(2) + foundry(1) + wafer(1)
        assert_eq!(score, 6);
    }

    #[test]
    fn test_best_ties_go_to_earlier_category() {
        let scores = RuleScores {
            scores: vec![(Category::Robotics, 3), (Category::Auto, 3)],
        };
        assert_eq!(scores.best(), Some((Category::Robotics, 3)));
        assert_eq!(scores.margin(), 0);
    }

    #[tokio::test]
    async fn test_confident_rules_skip_llm() {
        let backend = ScriptedBackend::always(r#"{"category": "health"}"#);
        let c = classifier(judge_with(backend.clone()));
        let result = c.classify(&article("a", "华为发布新款手机", "搭载自研芯片的智能手机")).await;
        assert_eq!(result.method, ClassificationMethod::Rules);
        assert_eq!(result.category, Some(Category::ConsumerElectronics));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_article_asks_llm_once() {
        let backend = ScriptedBackend::always(r#"{"category": "Auto"}"#);
        let judge = Arc::new(judge_with(backend.clone()));
        let c = Classifier::new(&ClassifierSettings::default(), judge);
        let a = article("a", "A quiet week in Shenzhen", "Little happened.");
        let first = c.classify(&a).await;
        let second = c.classify(&a).await;
        assert_eq!(first.category, Some(Category::Auto));
        assert_eq!(first.method, ClassificationMethod::Llm);
        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_rules_or_uncategorized() {
        let c = classifier(offline_judge());
        // robot(2) vs car(2): a tie is not confident.
        let tied = c.classify(&article("t", "Robot car", "")).await;
        assert_eq!(tied.method, ClassificationMethod::RuleFallback);
        assert_eq!(tied.category, Some(Category::Robotics));

        let nothing = c.classify(&article("n", "A quiet week in Shenzhen", "")).await;
        assert_eq!(nothing.method, ClassificationMethod::Uncategorized);
        assert_eq!(nothing.category, None);
    }

    #[tokio::test]
    async fn test_unknown_llm_category_is_a_failure() {
        let backend = ScriptedBackend::always(r#"{"category": "sports"}"#);
        let c = classifier(judge_with(backend));
        let result = c.classify(&article("n", "A quiet week in Shenzhen", "")).await;
        assert_eq!(result.method, ClassificationMethod::Uncategorized);
    }

    #[test]
    fn test_configured_keywords_replace_defaults() {
        let mut settings = ClassifierSettings {
            extend_defaults: false,
            ..ClassifierSettings::default()
        };
        settings.keywords.insert(Category::Health, vec!["chip".to_string()]);
        let c = Classifier::new(&settings, Arc::new(offline_judge()));
        let scores = c.rule_scores(&article("a", "New chip", ""));
        assert_eq!(scores.scores, vec![(Category::Health, 2)]);
    }

    #[tokio::test]
    async fn test_cluster_primary_is_representative_category() {
        let store = ArticleStore::from_articles(vec![
            article("rep", "Nvidia GPU shortage eases", "Chip supply recovers."),
            article("f", "Nvidia shares jump on GPU supply", "Investors cheer the stock."),
        ])
        .unwrap();
        let cluster = EventCluster {
            cluster_id: "c-f".to_string(),
            member_article_ids: vec!["rep".to_string(), "f".to_string()],
            representative_article_id: "rep".to_string(),
            retained_member_ids: vec!["rep".to_string(), "f".to_string()],
            assessments: vec![],
        };
        let c = classifier(offline_judge());
        let result = c.classify_clusters(&[cluster], &store).await;
        assert_eq!(result[0].primary, Some(Category::Semiconductor));
        assert_eq!(result[0].members[0].article_id, "rep");
        assert!(result[0].categories.contains(&Category::Semiconductor));
    }

    #[test]
    fn test_default_keywords_skip_ambiguous_words() {
        let c = classifier(offline_judge());

        let tesla = c.rule_scores(&article("t", "Tesla recalls Model Y", "The automaker will fix the seats."));
        assert_eq!(tesla.best().map(|(category, _)| category), Some(Category::Auto));
        assert!(!tesla.scores.iter().any(|(category, _)| *category == Category::Ai));

        let hbm = c.rule_scores(&article("h", "SK hynix raises HBM prices", "Memory shares the spotlight."));
        assert_eq!(hbm.best().map(|(category, _)| category), Some(Category::Semiconductor));
        assert!(!hbm.scores.iter().any(|(category, _)| *category == Category::Investment));

        let agents = c.rule_scores(&article("a", "OpenAI ships AI agents for coding", ""));
        assert_eq!(agents.best().map(|(category, _)| category), Some(Category::Ai));
    }
}
