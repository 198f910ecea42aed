//! One daily batch, start to finish.
//!
//! The ledger lock is taken before anything else so a second run for any date
//! fails immediately instead of after collection.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::briefing::{AssemblyInput, Briefing, BriefingAssembler, CollectionStats};
use crate::classifier::Classifier;
use crate::clustering::SimilarityClusterer;
use crate::collector::{collect_all, Collector, HttpCollector};
use crate::config::{Credentials, Settings, APP_DIR};
use crate::io;
use crate::ledger::LedgerStore;
use crate::llm::{Judge, JudgmentCache, LlmBackend, LlmClient};
use crate::models::Article;
use crate::normalizer::{CollectionWindow, Normalizer};
use crate::people::KeyPersonExtractor;
use crate::prediction::{Evidence, PredictionTracker, TrackerReport};
use crate::publisher::{DocumentPublisher, FeishuPublisher, PublishedDocument};
use crate::render::{save_markdown, MarkdownRenderer};
use crate::resolver::ClusterResolver;
use crate::store::ArticleStore;
use crate::translator::{translate_articles, LlmTranslator, Translator};

/// The replaceable outside world: fetching, LLM, translation and remote output.
pub struct Collaborators {
    pub collector: Arc<dyn Collector>,
    pub judge: Arc<Judge>,
    pub translator: Option<Arc<dyn Translator>>,
    pub publisher: Option<Arc<dyn DocumentPublisher>>,
}

impl Collaborators {
    /// HTTP collection, the configured LLM provider (offline when its key is
    /// missing) and Feishu output when enabled and credentialed.
    pub fn from_settings(settings: &Settings, credentials: &Credentials, cache_path: &Path) -> Result<Self> {
        let collector: Arc<dyn Collector> = Arc::new(HttpCollector::new(&settings.collection)?);

        let cache = JudgmentCache::open(cache_path)?;
        let backend: Option<Arc<dyn LlmBackend>> = match LlmClient::from_settings(&settings.llm, credentials)? {
            Some(client) => {
                info!(provider = ?settings.llm.provider, model = client.model(), "LLM enabled");
                Some(Arc::new(client))
            }
            None => {
                warn!(provider = ?settings.llm.provider, "no API key, running offline on cached judgments");
                None
            }
        };
        let judge = Arc::new(Judge::new(backend, cache, &settings.llm));

        let translator: Option<Arc<dyn Translator>> = if judge.is_online() {
            Some(Arc::new(LlmTranslator::new(judge.clone())))
        } else {
            None
        };

        let publisher: Option<Arc<dyn DocumentPublisher>> =
            match FeishuPublisher::from_settings(&settings.remote, credentials)? {
                Some(p) => Some(Arc::new(p)),
                None => {
                    if settings.remote.enabled {
                        warn!("remote output enabled but FEISHU_APP_ID/FEISHU_APP_SECRET are not set");
                    }
                    None
                }
            };

        Ok(Self {
            collector,
            judge,
            translator,
            publisher,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_date: NaiveDate,
    /// Where the Markdown briefing is written.
    pub output_dir: PathBuf,
    /// Where the JSON briefing is saved for later re-publishing.
    pub briefings_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub skip_remote: bool,
}

impl RunOptions {
    /// Paths from settings, falling back to the documents and data directories.
    pub fn from_settings(settings: &Settings, run_date: NaiveDate, output_dir: Option<PathBuf>) -> Result<Self> {
        let output_dir = match output_dir.or_else(|| settings.briefing.output_dir.clone()) {
            Some(dir) => dir,
            None => dirs::document_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR),
        };
        let ledger_path = match &settings.predictions.ledger_path {
            Some(path) => path.clone(),
            None => io::default_ledger_path()?,
        };
        Ok(Self {
            run_date,
            output_dir,
            briefings_dir: io::get_default_briefings_dir()?,
            ledger_path,
            skip_remote: false,
        })
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub briefing: Briefing,
    pub markdown_path: PathBuf,
    pub json_path: PathBuf,
    pub tracker: TrackerReport,
    pub published: Option<PublishedDocument>,
    /// Set when remote publishing was attempted and failed.
    pub remote_error: Option<String>,
}

pub struct Pipeline {
    settings: Settings,
    collaborators: Collaborators,
}

impl Pipeline {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        let settings = &self.settings;
        let judge = &self.collaborators.judge;
        let run_date = options.run_date;
        info!(%run_date, "daily run started");

        let ledger_store = LedgerStore::new(&options.ledger_path);
        let lock = ledger_store.lock().context("Failed to lock the prediction ledger")?;
        let mut ledger = ledger_store
            .load(&lock)
            .context("Failed to load the prediction ledger")?;

        // Collection
        let collection = collect_all(
            self.collaborators.collector.as_ref(),
            &settings.sources,
            run_date,
            settings.collection.concurrency,
            Duration::from_secs(settings.collection.timeout_secs),
        )
        .await;
        let collected_payloads = collection.payloads.len();
        let failed_sources = collection.failed_source_names();

        // Normalization
        let source_priority = settings.source_priority();
        let normalized = Normalizer::new(settings.collection.excerpt_chars, source_priority.clone())
            .with_window(CollectionWindow::for_run_date(
                run_date,
                settings.collection.lookback_hours,
            ))
            .normalize(collection.payloads);
        let dropped_payloads = normalized.dropped.len();
        let mut store =
            ArticleStore::from_articles(normalized.articles).context("Normalized articles have duplicate ids")?;

        translate_articles(
            &mut store,
            self.collaborators.translator.as_deref(),
            &settings.collection.target_language,
            settings.llm.concurrency,
        )
        .await;

        // Clustering
        let person_terms = settings
            .people
            .iter()
            .flat_map(|p| std::iter::once(p.name.clone()).chain(p.aliases.iter().cloned()));
        let clusters = SimilarityClusterer::new(&settings.clustering)
            .with_entity_terms(person_terms)
            .cluster(store.articles());
        for cluster in &clusters {
            for id in &cluster.member_article_ids {
                store
                    .assign_cluster(id, &cluster.cluster_id)
                    .context("Failed to record cluster membership")?;
            }
        }

        let events = ClusterResolver::new(settings.resolver.clone(), source_priority, judge.clone())
            .with_concurrency(settings.llm.concurrency)
            .resolve(&clusters, &store)
            .await;

        let classifications = Classifier::new(&settings.classifier, judge.clone())
            .with_concurrency(settings.llm.concurrency)
            .classify_clusters(&events, &store)
            .await;

        let retained: Vec<&Article> = events
            .iter()
            .flat_map(|e| e.retained_member_ids.iter())
            .filter_map(|id| store.get(id))
            .collect();
        let mentions = KeyPersonExtractor::new(settings.people.clone(), judge.clone())
            .with_concurrency(settings.llm.concurrency)
            .extract(&retained)
            .await;

        // Predictions
        let evidence: Vec<Evidence<'_>> = classifications
            .iter()
            .flat_map(|c| c.members.iter())
            .filter_map(|m| {
                Some(Evidence {
                    article: store.get(&m.article_id)?,
                    category: m.category,
                })
            })
            .collect();
        let tracker = PredictionTracker::new(settings.predictions.clone(), judge.clone())
            .with_concurrency(settings.llm.concurrency)
            .run(&mut ledger, run_date, &evidence)
            .await;

        let briefing = BriefingAssembler::new(settings.briefing.clone()).assemble(AssemblyInput {
            run_date,
            generated_at: Utc::now(),
            store: &store,
            clusters: &events,
            classifications: &classifications,
            mentions: &mentions,
            ledger: &ledger,
            tracker: &tracker,
            collection: CollectionStats {
                collected_payloads,
                failed_sources,
                dropped_payloads,
            },
        });

        // Output
        let markdown = MarkdownRenderer::render(&briefing);
        let markdown_path = save_markdown(&markdown, &options.output_dir, &MarkdownRenderer::filename(&briefing))?;
        info!(path = %markdown_path.display(), "Markdown briefing written");
        let json_path = io::save_briefing(&briefing, &options.briefings_dir)?;

        ledger_store
            .save(&lock, &ledger)
            .context("Failed to save the prediction ledger")?;
        drop(lock);

        let (published, remote_error) = match (&self.collaborators.publisher, options.skip_remote) {
            (Some(publisher), false) => {
                let title = format!("{} {}", briefing.title, run_date.format("%Y-%m-%d"));
                match publisher.publish(&title, &markdown).await {
                    Ok(document) => (Some(document), None),
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "remote publishing failed; local briefing is unaffected");
                        (None, Some(format!("{:#}", e)))
                    }
                }
            }
            _ => (None, None),
        };

        info!(
            %run_date,
            articles = briefing.stats.articles,
            clusters = briefing.stats.clusters,
            "daily run finished"
        );
        Ok(RunOutcome {
            briefing,
            markdown_path,
            json_path,
            tracker,
            published,
            remote_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::error::LedgerError;
    use crate::llm::test_support::offline_judge;
    use crate::models::{Category, RawPayload, Region};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeCollector;

    fn payload(source: &str, title: &str, body: &str, url: &str, published: &str) -> RawPayload {
        RawPayload {
            source_name: source.to_string(),
            language: "en".to_string(),
            title: Some(title.to_string()),
            url: Some(url.to_string()),
            published: Some(published.to_string()),
            body: Some(body.to_string()),
            ..RawPayload::default()
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        async fn collect(&self, source: &SourceConfig, _run_date: NaiveDate) -> Result<Vec<RawPayload>> {
            Ok(match source.name.as_str() {
                "TechCrunch" => vec![
                    payload(
                        "TechCrunch",
                        "Nvidia unveils Blackwell chip",
                        "The chip targets data centers.",
                        "https://techcrunch.test/nvidia-blackwell",
                        "2026-01-01T09:00:00Z",
                    ),
                    payload(
                        "TechCrunch",
                        "Tesla recalls Model Y over seat belts",
                        "The automaker recalls 5,000 cars.",
                        "https://techcrunch.test/tesla-recall",
                        "2026-01-01T10:00:00Z",
                    ),
                    payload("TechCrunch", "", "no title", "https://techcrunch.test/x", "2026-01-01T10:00:00Z"),
                ],
                "36Kr" => vec![payload(
                    "36Kr",
                    "Nvidia reveals new Blackwell chip, details on power draw",
                    "The chip draws 700W at full load.",
                    "https://36kr.test/p/1",
                    "2026-01-01T11:00:00Z",
                )],
                _ => anyhow::bail!("connection refused"),
            })
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl DocumentPublisher for FailingPublisher {
        async fn publish(&self, _title: &str, _markdown: &str) -> Result<PublishedDocument> {
            anyhow::bail!("Feishu API error 99991663: invalid token")
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.sources = vec![
            SourceConfig::feed("TechCrunch", "https://techcrunch.test/feed", Region::Us, "en"),
            SourceConfig::feed("36Kr", "https://36kr.test/feed", Region::China, "en"),
            SourceConfig::feed("Down", "https://down.test/feed", Region::Japan, "en"),
        ];
        settings.collection.target_language = "en".to_string();
        settings
    }

    fn pipeline(publisher: Option<Arc<dyn DocumentPublisher>>) -> Pipeline {
        Pipeline::new(
            settings(),
            Collaborators {
                collector: Arc::new(FakeCollector),
                judge: Arc::new(offline_judge()),
                translator: None,
                publisher,
            },
        )
    }

    fn options(dir: &TempDir) -> RunOptions {
        RunOptions {
            run_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            output_dir: dir.path().join("out"),
            briefings_dir: dir.path().join("briefings"),
            ledger_path: dir.path().join("predictions.json"),
            skip_remote: false,
        }
    }

    #[tokio::test]
    async fn test_run_produces_briefing_and_ledger() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir);
        let outcome = pipeline(None).run(&opts).await.unwrap();

        let b = &outcome.briefing;
        assert_eq!(b.stats.collected_payloads, 4);
        assert_eq!(b.stats.dropped_payloads, 1);
        assert_eq!(b.stats.failed_sources, vec!["Down"]);
        assert_eq!(b.stats.articles, 3);
        assert_eq!(b.stats.clusters, 2);

        let chips = b.section(Some(Category::Semiconductor)).unwrap();
        assert_eq!(chips.items[0].representative.source_name, "TechCrunch");
        assert_eq!(chips.items[0].followups.len(), 1);
        assert_eq!(chips.items[0].followups[0].article.source_name, "36Kr");
        assert!(b.section(Some(Category::Auto)).is_some());
        assert!(b.articles.iter().all(|a| a.canonical_cluster_id.is_some()));

        assert!(outcome.markdown_path.exists());
        assert_eq!(io::load_briefing(&outcome.json_path).unwrap().run_date, opts.run_date);
        assert!(opts.ledger_path.exists());
        assert!(!LedgerStore::new(&opts.ledger_path).lock_path().exists());
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_ledger_locked() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir);
        let _held = LedgerStore::new(&opts.ledger_path).lock().unwrap();

        let err = pipeline(None).run(&opts).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Locked { .. })
        ));
        assert!(!opts.output_dir.exists());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_markdown() {
        let dir = TempDir::new().unwrap();
        let opts = options(&dir);
        let outcome = pipeline(Some(Arc::new(FailingPublisher))).run(&opts).await.unwrap();
        assert!(outcome.markdown_path.exists());
        assert!(outcome.published.is_none());
        assert!(outcome.remote_error.unwrap().contains("invalid token"));

        let skipped = pipeline(Some(Arc::new(FailingPublisher)))
            .run(&RunOptions {
                skip_remote: true,
                ..opts
            })
            .await
            .unwrap();
        assert!(skipped.remote_error.is_none());
    }
}
