use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed twelve-way taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ai,
    Robotics,
    EmbodiedAi,
    Semiconductor,
    Auto,
    Health,
    Economy,
    Business,
    Politics,
    Investment,
    ConsumerElectronics,
    KeyPeople,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Ai,
        Category::Robotics,
        Category::EmbodiedAi,
        Category::Semiconductor,
        Category::Auto,
        Category::Health,
        Category::Economy,
        Category::Business,
        Category::Politics,
        Category::Investment,
        Category::ConsumerElectronics,
        Category::KeyPeople,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Category::Ai => "ai",
            Category::Robotics => "robotics",
            Category::EmbodiedAi => "embodied_ai",
            Category::Semiconductor => "semiconductor",
            Category::Auto => "auto",
            Category::Health => "health",
            Category::Economy => "economy",
            Category::Business => "business",
            Category::Politics => "politics",
            Category::Investment => "investment",
            Category::ConsumerElectronics => "consumer_electronics",
            Category::KeyPeople => "key_people",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_lowercase();
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Section title used in the rendered briefing.
    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Ai => "AI类",
            Category::Robotics => "机器人类",
            Category::EmbodiedAi => "具身智能类",
            Category::Semiconductor => "半导体行业类",
            Category::Auto => "汽车类",
            Category::Health => "健康医疗类",
            Category::Economy => "经济政策类",
            Category::Business => "商业科技类",
            Category::Politics => "政治政策类",
            Category::Investment => "投资财经类",
            Category::ConsumerElectronics => "消费电子类",
            Category::KeyPeople => "关键人物发言",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Category::Ai => "🤖",
            Category::Robotics => "🦾",
            Category::EmbodiedAi => "👓",
            Category::Semiconductor => "💾",
            Category::Auto => "🚗",
            Category::Health => "🏥",
            Category::Economy => "📊",
            Category::Business => "💼",
            Category::Politics => "🏛️",
            Category::Investment => "📈",
            Category::ConsumerElectronics => "📱",
            Category::KeyPeople => "🎤",
        }
    }

    /// Scope description handed to the LLM in classification prompts.
    pub fn scope(&self) -> &'static str {
        match self {
            Category::Ai => "AI technology, agents, AI coding, model releases and features",
            Category::Robotics => "humanoid, industrial and military robots",
            Category::EmbodiedAi => "embodied intelligence: AI glasses, wearables, new interaction devices",
            Category::Semiconductor => "chips, memory, process nodes, fab equipment",
            Category::Auto => "EVs, combustion cars, autonomous driving",
            Category::Health => "biotech, medical devices, pharma",
            Category::Economy => "macroeconomy, industrial policy, trade",
            Category::Business => "company news, M&A, corporate strategy",
            Category::Politics => "tech regulation, geopolitics",
            Category::Investment => "stock markets, venture capital, IPOs",
            Category::ConsumerElectronics => "phones, computers, smart home",
            Category::KeyPeople => "statements, views and forecasts of tech leaders",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    China,
    Us,
    Japan,
    Korea,
    Europe,
    Sea,
    #[default]
    #[serde(other)]
    Other,
}

/// One item as produced by a collector, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_name: String,
    pub source_region: Region,
    pub language: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

/// A canonical article. `id` never changes after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub body_excerpt: String,
    pub source_name: String,
    pub source_region: Region,
    pub language: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub author: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Title in the run's working language; equals `title` until translated.
    pub normalized_title: String,
    pub normalized_excerpt: String,
    /// Set when translation failed and the original text stands in.
    #[serde(default)]
    pub translation_degraded: bool,
    pub canonical_cluster_id: Option<String>,
}

impl Article {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body_excerpt: impl Into<String>,
        source_name: impl Into<String>,
        published_at: DateTime<Utc>,
        url: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let body_excerpt = body_excerpt.into();
        Self {
            id: id.into(),
            normalized_title: title.clone(),
            normalized_excerpt: body_excerpt.clone(),
            title,
            body_excerpt,
            source_name: source_name.into(),
            source_region: Region::Other,
            language: "en".to_string(),
            published_at,
            url: url.into(),
            author: None,
            image_urls: Vec::new(),
            translation_degraded: false,
            canonical_cluster_id: None,
        }
    }

    /// Working-language title and excerpt, the text similarity is computed on.
    pub fn matching_text(&self) -> String {
        format!("{} {}", self.normalized_title, self.normalized_excerpt)
    }

    /// Original and normalized text together, for name and keyword lookups that
    /// must work in either language.
    pub fn searchable_text(&self) -> String {
        if self.normalized_title == self.title && self.normalized_excerpt == self.body_excerpt {
            format!("{}\n{}", self.title, self.body_excerpt)
        } else {
            format!(
                "{}\n{}\n{}\n{}",
                self.title, self.body_excerpt, self.normalized_title, self.normalized_excerpt
            )
        }
    }
}
