use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::{Category, Region};
use crate::prediction::Horizon;

pub const APP_DIR: &str = "daily-briefing";

pub const MAX_LLM_ATTEMPTS: u32 = 10;
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 30;
pub const MAX_WINDOW_HOURS: i64 = 24 * 30;
pub const MAX_GRACE_DAYS: i64 = 3650;

/// Secrets read from the environment. Every key is optional: without LLM keys
/// the run uses cached judgments and rule fallbacks, without Feishu keys the
/// remote document step is skipped.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub feishu_app_id: Option<String>,
    pub feishu_app_secret: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::try_load_dotenv();

        Self {
            anthropic_api_key: non_empty_var("ANTHROPIC_API_KEY"),
            deepseek_api_key: non_empty_var("DEEPSEEK_API_KEY"),
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            feishu_app_id: non_empty_var("FEISHU_APP_ID"),
            feishu_app_secret: non_empty_var("FEISHU_APP_SECRET"),
        }
    }

    pub fn llm_key(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
            Provider::Deepseek => self.deepseek_api_key.as_deref(),
            Provider::Openai => self.openai_api_key.as_deref(),
        }
    }

    pub fn feishu(&self) -> Option<(&str, &str)> {
        match (&self.feishu_app_id, &self.feishu_app_secret) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }

    fn try_load_dotenv() {
        // 1. Current directory (for development)
        if dotenvy::dotenv().is_ok() {
            return;
        }

        // 2. ~/.config/daily-briefing/.env
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join(APP_DIR).join(".env");
            if config_path.exists() && dotenvy::from_path(&config_path).is_ok() {
                return;
            }
        }

        // 3. ~/.env
        if let Some(home_dir) = dirs::home_dir() {
            let home_path = home_dir.join(".env");
            if home_path.exists() {
                let _ = dotenvy::from_path(&home_path);
            }
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    Deepseek,
    Openai,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-3-5-haiku-20241022",
            Provider::Deepseek => "deepseek-chat",
            Provider::Openai => "gpt-4o-mini",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Deepseek => "https://api.deepseek.com",
            Provider::Openai => "https://api.openai.com/v1",
        }
    }
}

/// Settings file contents. Unknown keys are rejected at every level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub llm: LlmSettings,
    pub collection: CollectionSettings,
    pub sources: Vec<SourceConfig>,
    pub clustering: ClusteringSettings,
    pub resolver: ResolverSettings,
    pub classifier: ClassifierSettings,
    pub people: Vec<PersonConfig>,
    pub predictions: PredictionSettings,
    pub briefing: BriefingSettings,
    pub remote: RemoteSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            collection: CollectionSettings::default(),
            sources: default_sources(),
            clustering: ClusteringSettings::default(),
            resolver: ResolverSettings::default(),
            classifier: ClassifierSettings::default(),
            people: default_people(),
            predictions: PredictionSettings::default(),
            briefing: BriefingSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSettings {
    pub provider: Provider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Maximum LLM calls in flight.
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub rate_limit_backoff_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            model: None,
            base_url: None,
            concurrency: 2,
            timeout_secs: 60,
            max_attempts: 3,
            backoff_ms: 1000,
            rate_limit_backoff_secs: 15,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectionSettings {
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Hours before the run day's UTC midnight still counted as that day.
    pub lookback_hours: i64,
    pub excerpt_chars: usize,
    pub target_language: String,
    pub max_items_per_source: usize,
    pub user_agent: String,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout_secs: 30,
            lookback_hours: 8,
            excerpt_chars: 600,
            target_language: "zh".to_string(),
            max_items_per_source: 50,
            user_agent: "Mozilla/5.0 (compatible; DailyBriefing/1.0)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Feed,
    JsonFeed,
    Html,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub region: Region,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// CSS selectors for `kind = "html"` listing pages.
    #[serde(default)]
    pub item_selector: Option<String>,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub time_selector: Option<String>,
    #[serde(default)]
    pub excerpt_selector: Option<String>,
}

impl SourceConfig {
    pub fn feed(name: &str, url: &str, region: Region, language: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            kind: SourceKind::Feed,
            region,
            language: language.to_string(),
            enabled: true,
            item_selector: None,
            title_selector: None,
            link_selector: None,
            time_selector: None,
            excerpt_selector: None,
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::feed("TechCrunch", "https://techcrunch.com/feed/", Region::Us, "en"),
        SourceConfig::feed("The Verge", "https://www.theverge.com/rss/index.xml", Region::Us, "en"),
        SourceConfig::feed("Ars Technica", "https://feeds.arstechnica.com/arstechnica/index", Region::Us, "en"),
        SourceConfig::feed("36Kr", "https://36kr.com/feed", Region::China, "zh"),
        SourceConfig::feed("IT之家", "https://www.ithome.com/rss/", Region::China, "zh"),
        SourceConfig::feed("Nikkei Asia", "https://asia.nikkei.com/rss/feed/nar", Region::Japan, "en"),
        SourceConfig::feed("The Register", "https://www.theregister.com/headlines.atom", Region::Europe, "en"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringSettings {
    pub window_hours: i64,
    /// Minimum pair score for two articles to be linked.
    pub threshold: f64,
    pub lexical_weight: f64,
    pub entity_weight: f64,
    /// Share of the score that decays linearly across the window.
    pub temporal_weight: f64,
    /// Multiplier for scores involving an article whose translation failed.
    pub degraded_penalty: f64,
    /// Extra entity names (companies, products) recognised in any script.
    pub entity_terms: Vec<String>,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            window_hours: 48,
            threshold: 0.45,
            lexical_weight: 0.5,
            entity_weight: 0.3,
            temporal_weight: 0.2,
            degraded_penalty: 0.85,
            entity_terms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSettings {
    /// Source names, most authoritative first. Empty means `[[sources]]` order.
    pub source_priority: Vec<String>,
    /// Follow-ups whose token novelty against the representative is below this
    /// are dropped without asking the LLM.
    pub novelty_floor: f64,
    pub max_followups: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            source_priority: Vec::new(),
            novelty_floor: 0.2,
            max_followups: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierSettings {
    /// Minimum rule score for a confident rule decision.
    pub min_score: u32,
    /// Minimum lead of the best category over the runner-up.
    pub min_margin: u32,
    /// Keep the built-in keyword lists and add `keywords` on top of them.
    pub extend_defaults: bool,
    pub keywords: BTreeMap<Category, Vec<String>>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            min_score: 2,
            min_margin: 1,
            extend_defaults: true,
            keywords: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl PersonConfig {
    pub fn new(id: &str, name: &str, aliases: &[&str], organization: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            organization: organization.map(str::to_string),
        }
    }
}

fn default_people() -> Vec<PersonConfig> {
    vec![
        PersonConfig::new("jensen-huang", "Jensen Huang", &["黄仁勋", "Huang"], Some("Nvidia")),
        PersonConfig::new("sam-altman", "Sam Altman", &["奥特曼", "Altman"], Some("OpenAI")),
        PersonConfig::new("elon-musk", "Elon Musk", &["马斯克", "Musk"], Some("Tesla")),
        PersonConfig::new("lei-jun", "Lei Jun", &["雷军"], Some("Xiaomi")),
        PersonConfig::new("lisa-su", "Lisa Su", &["苏姿丰"], Some("AMD")),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictionSettings {
    pub enabled: bool,
    pub horizons: Vec<Horizon>,
    /// Days after `due_at` before an unresolved prediction expires. Unset means
    /// the horizon's own length.
    pub grace_days: Option<i64>,
    /// Minimum token overlap between a prediction and an article for the
    /// article to count as evidence.
    pub evidence_min_overlap: f64,
    /// Overlap at which a cue-free article confirms a prediction without the LLM.
    pub confirm_overlap: f64,
    pub max_evidence: usize,
    pub ledger_path: Option<PathBuf>,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            horizons: Horizon::ALL.to_vec(),
            grace_days: None,
            evidence_min_overlap: 0.3,
            confirm_overlap: 0.75,
            max_evidence: 5,
            ledger_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPeopleMode {
    /// Mentions get their own "关键人物发言" section.
    #[default]
    Dedicated,
    /// Mentions are attached under the category of the article they came from.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BriefingSettings {
    pub title: String,
    pub display_order: Vec<Category>,
    pub key_people: KeyPeopleMode,
    pub max_clusters_per_category: Option<usize>,
    pub output_dir: Option<PathBuf>,
}

impl Default for BriefingSettings {
    fn default() -> Self {
        Self {
            title: "科技日报".to_string(),
            display_order: Category::ALL.to_vec(),
            key_people: KeyPeopleMode::Dedicated,
            max_clusters_per_category: None,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub base_url: String,
    /// Folder the daily document is created in; the app's root when unset.
    pub folder_token: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://open.feishu.cn".to_string(),
            folder_token: None,
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("briefing.toml"))
    }

    /// Load from `path`, or from the default location when it exists, or fall
    /// back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let c = &self.clustering;
        if !(0.0..=1.0).contains(&c.threshold) {
            return invalid(format!("clustering.threshold must be in [0, 1], got {}", c.threshold));
        }
        if !(0.0..=1.0).contains(&c.degraded_penalty) {
            return invalid(format!(
                "clustering.degraded_penalty must be in [0, 1], got {}",
                c.degraded_penalty
            ));
        }
        if c.lexical_weight < 0.0 || c.entity_weight < 0.0 {
            return invalid("clustering weights must not be negative".to_string());
        }
        if c.lexical_weight + c.entity_weight <= 0.0 {
            return invalid("clustering.lexical_weight and entity_weight must not both be zero".to_string());
        }
        if !(0.0..=1.0).contains(&c.temporal_weight) {
            return invalid(format!(
                "clustering.temporal_weight must be in [0, 1], got {}",
                c.temporal_weight
            ));
        }
        if c.window_hours <= 0 || c.window_hours > MAX_WINDOW_HOURS {
            return invalid(format!(
                "clustering.window_hours must be in 1..={}",
                MAX_WINDOW_HOURS
            ));
        }
        if !(0.0..=1.0).contains(&self.resolver.novelty_floor) {
            return invalid("resolver.novelty_floor must be in [0, 1]".to_string());
        }
        let p = &self.predictions;
        if !(0.0..=1.0).contains(&p.evidence_min_overlap)
            || !(0.0..=1.0).contains(&p.confirm_overlap)
            || p.confirm_overlap < p.evidence_min_overlap
        {
            return invalid(
                "predictions overlaps must be in [0, 1] with confirm_overlap >= evidence_min_overlap"
                    .to_string(),
            );
        }
        if matches!(self.predictions.grace_days, Some(d) if !(0..=MAX_GRACE_DAYS).contains(&d)) {
            return invalid(format!("predictions.grace_days must be in 0..={}", MAX_GRACE_DAYS));
        }
        if self.llm.concurrency == 0 || self.collection.concurrency == 0 {
            return invalid("concurrency limits must be at least 1".to_string());
        }
        if !(1..=MAX_LLM_ATTEMPTS).contains(&self.llm.max_attempts) {
            return invalid(format!("llm.max_attempts must be in 1..={}", MAX_LLM_ATTEMPTS));
        }
        if !(0..=MAX_LOOKBACK_HOURS).contains(&self.collection.lookback_hours) {
            return invalid(format!(
                "collection.lookback_hours must be in 0..={}",
                MAX_LOOKBACK_HOURS
            ));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return invalid(format!("duplicate source name: {}", source.name));
            }
            if source.kind == SourceKind::Html
                && (source.item_selector.is_none() || source.link_selector.is_none())
            {
                return invalid(format!(
                    "html source {} needs item_selector and link_selector",
                    source.name
                ));
            }
        }

        let mut ids = HashSet::new();
        for person in &self.people {
            if !ids.insert(person.id.as_str()) {
                return invalid(format!("duplicate person id: {}", person.id));
            }
        }

        let mut seen = HashSet::new();
        if !self.briefing.display_order.iter().all(|c| seen.insert(*c)) {
            return invalid("briefing.display_order lists a category twice".to_string());
        }

        Ok(())
    }

    /// Source names, most authoritative first.
    pub fn source_priority(&self) -> Vec<String> {
        if self.resolver.source_priority.is_empty() {
            self.sources.iter().map(|s| s.name.clone()).collect()
        } else {
            self.resolver.source_priority.clone()
        }
    }
}
