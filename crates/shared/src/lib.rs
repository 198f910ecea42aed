// Public modules
pub mod briefing;
pub mod classifier;
pub mod clustering;
pub mod collector;
pub mod config;
pub mod error;
pub mod io;
pub mod ledger;
pub mod llm;
pub mod models;
pub mod normalizer;
pub mod people;
pub mod pipeline;
pub mod prediction;
pub mod publisher;
pub mod render;
pub mod resolver;
pub mod store;
pub mod text;
pub mod translator;

// Re-export commonly used types
pub use briefing::{Briefing, BriefingAssembler};
pub use classifier::Classifier;
pub use clustering::{Cluster, SimilarityClusterer};
pub use collector::{Collector, HttpCollector};
pub use config::{Credentials, Settings};
pub use error::{ConfigError, JudgmentError, LedgerError};
pub use io::{get_default_briefings_dir, list_briefings, load_briefing, save_briefing};
pub use ledger::{LedgerStore, PredictionLedger};
pub use llm::{Judge, JudgmentCache, LlmBackend, LlmClient};
pub use models::{Article, Category, RawPayload};
pub use pipeline::{Collaborators, Pipeline, RunOptions, RunOutcome};
pub use publisher::{DocumentPublisher, FeishuPublisher};
pub use render::MarkdownRenderer;
pub use resolver::{ClusterResolver, EventCluster};
