use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shared::classifier::ClassificationMethod;
use shared::clustering::Cluster;
use shared::config::{ClassifierSettings, ClusteringSettings, LlmSettings, PredictionSettings, ResolverSettings};
use shared::prediction::{Evidence, Horizon, Prediction, PredictionStatus, PredictionTracker};
use shared::resolver::FollowUpOutcome;
use shared::store::ArticleStore;
use shared::{
    Article, Category, Classifier, ClusterResolver, Judge, JudgmentCache, LlmBackend, PredictionLedger,
    SimilarityClusterer,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Answers every prompt with the same text and counts calls.
struct FixedBackend {
    response: String,
    calls: AtomicUsize,
}

impl FixedBackend {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for FixedBackend {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

fn fast_settings() -> LlmSettings {
    LlmSettings {
        backoff_ms: 0,
        rate_limit_backoff_secs: 0,
        timeout_secs: 5,
        ..LlmSettings::default()
    }
}

fn online(backend: Arc<FixedBackend>, cache: JudgmentCache) -> Arc<Judge> {
    Arc::new(Judge::new(Some(backend), cache, &fast_settings()))
}

fn offline() -> Arc<Judge> {
    Arc::new(Judge::offline(JudgmentCache::in_memory().unwrap()))
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, hour, minute, 0).unwrap()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn article(id: &str, source: &str, title: &str, excerpt: &str, published: DateTime<Utc>) -> Article {
    Article::new(id, title, excerpt, source, published, format!("https://news.test/{}", id))
}

fn single_cluster(articles: &[Article]) -> Cluster {
    Cluster {
        cluster_id: "c-1".to_string(),
        member_article_ids: articles.iter().map(|a| a.id.clone()).collect(),
    }
}

fn chip_story(rep_excerpt: &str) -> Vec<Article> {
    vec![
        article("tc", "TechCrunch", "Acme unveils Falcon chip", rep_excerpt, at(9, 0)),
        article(
            "kr",
            "36Kr",
            "Acme reveals new Falcon chip, details on power draw",
            "The chip draws 700W at full load.",
            at(11, 0),
        ),
    ]
}

fn partition(clusters: Vec<Cluster>) -> Vec<(String, BTreeSet<String>)> {
    clusters
        .into_iter()
        .map(|c| (c.cluster_id, c.member_article_ids.into_iter().collect()))
        .collect()
}

async fn cluster_and_resolve(articles: Vec<Article>) -> (Vec<Cluster>, Vec<shared::EventCluster>) {
    let clusters = SimilarityClusterer::new(&ClusteringSettings::default()).cluster(&articles);
    let store = ArticleStore::from_articles(articles).unwrap();
    let backend = FixedBackend::new(r#"{"significant": false, "kind": null, "detail": "same facts"}"#);
    let resolver = ClusterResolver::new(
        ResolverSettings::default(),
        vec!["TechCrunch".to_string(), "36Kr".to_string()],
        online(backend, JudgmentCache::in_memory().unwrap()),
    );
    let events = resolver.resolve(&clusters, &store).await;
    (clusters, events)
}

#[tokio::test]
async fn test_follow_up_with_new_power_figure_is_kept() {
    let (clusters, events) = cluster_and_resolve(chip_story("The chip targets data centers.")).await;

    assert_eq!(clusters.len(), 1);
    let event = &events[0];
    assert_eq!(event.representative_article_id, "tc");
    assert_eq!(event.retained_member_ids, vec!["tc", "kr"]);
    assert_eq!(event.assessment("kr").unwrap().outcome, FollowUpOutcome::NewFigure);
}

#[tokio::test]
async fn test_follow_up_repeating_power_figure_is_dropped() {
    let (clusters, events) =
        cluster_and_resolve(chip_story("The chip targets data centers and draws 700W.")).await;

    assert_eq!(clusters.len(), 1);
    let event = &events[0];
    assert_eq!(event.representative_article_id, "tc");
    assert_eq!(event.retained_member_ids, vec!["tc"]);
    assert!(!event.assessment("kr").unwrap().outcome.is_retained());
}

#[test]
fn test_clustering_ignores_input_order() {
    let articles = vec![
        article("a", "TechCrunch", "Acme unveils Falcon chip", "", at(9, 0)),
        article("b", "36Kr", "Acme Falcon chip power draw detailed", "", at(10, 0)),
        article("c", "The Verge", "Falcon power draw worries data centers", "", at(11, 0)),
        article("x", "TechCrunch", "Tesla recalls Model Y", "", at(10, 0)),
        article("y", "IT之家", "小米发布新款手机", "", at(12, 0)),
    ];
    let clusterer = SimilarityClusterer::new(&ClusteringSettings::default());
    let first = clusterer.cluster(&articles);

    // a-b and b-c link directly, so a and c share a cluster through b.
    assert_eq!(first[0].member_article_ids, vec!["a", "b", "c"]);
    let expected = partition(first);

    let mut shuffled = articles.clone();
    for step in 0..articles.len() {
        shuffled.rotate_left(step % 3 + 1);
        if step % 2 == 0 {
            shuffled.reverse();
        }
        let clusters = clusterer.cluster(&shuffled);
        // Members follow the order they were handed in.
        for cluster in &clusters {
            let positions: Vec<usize> = cluster
                .member_article_ids
                .iter()
                .filter_map(|id| shuffled.iter().position(|a| &a.id == id))
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(partition(clusters), expected);
    }
}

#[tokio::test]
async fn test_representative_is_deterministic_and_always_retained() {
    let articles = vec![
        article("m1", "36Kr", "Acme revenue report", "Revenue rose 12%.", at(9, 0)),
        article("m2", "Reuters", "Acme revenue report", "Revenue rose 12%.", at(9, 0)),
        article("m3", "The Verge", "Acme revenue report", "Margins hit 40%.", at(10, 0)),
        article("m4", "TechCrunch", "Acme revenue report", "Headcount fell 5%.", at(10, 30)),
        article("m5", "IT之家", "Acme revenue report", "Shares jumped 8%.", at(11, 0)),
    ];
    let settings = ResolverSettings {
        max_followups: 2,
        ..ResolverSettings::default()
    };
    let resolver = ClusterResolver::new(settings, vec!["Reuters".to_string(), "36Kr".to_string()], offline());

    let store = ArticleStore::from_articles(articles.clone()).unwrap();
    let forward = resolver.resolve(&[single_cluster(&articles)], &store).await;

    let mut reversed = articles.clone();
    reversed.reverse();
    let backward = resolver.resolve(&[single_cluster(&reversed)], &store).await;

    let event = &forward[0];
    assert_eq!(event.representative_article_id, "m2");
    assert_eq!(backward[0].representative_article_id, "m2");
    assert_eq!(event.retained_member_ids, backward[0].retained_member_ids);

    assert!(event.retained_member_ids.len() <= event.member_article_ids.len());
    assert_eq!(event.retained_member_ids[0], event.representative_article_id);
    assert_eq!(event.retained_member_ids.len(), 3);
    let over_cap = event
        .assessments
        .iter()
        .filter(|a| a.outcome == FollowUpOutcome::OverCap)
        .count();
    assert_eq!(over_cap, 1);
}

#[tokio::test]
async fn test_classification_is_stable_across_runs() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("judgments.sqlite3");
    let vague = article("v", "36Kr", "Quarterly update from the team", "Plans for the year ahead.", at(9, 0));

    let backend = FixedBackend::new(r#"{"category": "business"}"#);
    let first = {
        let classifier = Classifier::new(
            &ClassifierSettings::default(),
            online(backend.clone(), JudgmentCache::open(&cache_path).unwrap()),
        );
        let a = classifier.classify(&vague).await;
        let b = classifier.classify(&vague).await;
        assert_eq!(a, b);
        a
    };
    assert_eq!(first.category, Some(Category::Business));
    assert_eq!(first.method, ClassificationMethod::Llm);
    assert_eq!(backend.calls(), 1);

    // A later run without an LLM answers from the persisted cache.
    let cached = Classifier::new(
        &ClassifierSettings::default(),
        Arc::new(Judge::offline(JudgmentCache::open(&cache_path).unwrap())),
    );
    assert_eq!(cached.classify(&vague).await, first);
}

#[tokio::test]
async fn test_week_prediction_lifecycle() {
    let tracker = PredictionTracker::new(PredictionSettings::default(), offline());
    let mut ledger = PredictionLedger::new();
    let created = date("2026-03-02");
    tracker
        .add(
            &mut ledger,
            Prediction::new(Category::Robotics, Horizon::Week, created, "Humanoid robot orders double"),
        )
        .unwrap();
    let id = "robotics-1w-2026-03-02";

    for day in 3..=8 {
        let run_date = NaiveDate::from_ymd_opt(2026, 3, day).unwrap();
        tracker.run(&mut ledger, run_date, &[]).await;
        assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Pending, "{}", run_date);
    }

    let news = article(
        "r1",
        "TechCrunch",
        "Humanoid robot orders double in first quarter",
        "",
        Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap(),
    );
    let report = tracker
        .run(
            &mut ledger,
            date("2026-03-09"),
            &[Evidence {
                article: &news,
                category: Some(Category::Robotics),
            }],
        )
        .await;
    assert_eq!(report.became_due, vec![id]);
    assert_eq!(report.resolved, vec![id]);

    let resolution = ledger.get(id).unwrap().resolution().cloned();
    for later in ["2026-03-20", "2026-06-01"] {
        let report = tracker.run(&mut ledger, date(later), &[]).await;
        assert!(report.expired.is_empty());
        let p = ledger.get(id).unwrap();
        assert_eq!(p.status(), PredictionStatus::Resolved);
        assert_eq!(p.resolution().cloned(), resolution);
    }
}

#[tokio::test]
async fn test_month_prediction_due_on_schedule() {
    let tracker = PredictionTracker::new(PredictionSettings::default(), offline());
    let mut ledger = PredictionLedger::new();
    tracker
        .add(
            &mut ledger,
            Prediction::new(
                Category::Semiconductor,
                Horizon::Month,
                date("2026-01-01"),
                "AI chip shortage eases",
            ),
        )
        .unwrap();
    let id = "semiconductor-1m-2026-01-01";
    assert_eq!(ledger.get(id).unwrap().due_at, date("2026-02-01"));

    tracker.run(&mut ledger, date("2026-01-15"), &[]).await;
    assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Pending);

    // Mixed signals need the LLM; offline the prediction is evaluated but stays due.
    let news = article(
        "s1",
        "Nikkei Asia",
        "AI chip shortage not over yet, suppliers say",
        "",
        Utc.with_ymd_and_hms(2026, 2, 2, 3, 0, 0).unwrap(),
    );
    let report = tracker
        .run(
            &mut ledger,
            date("2026-02-02"),
            &[Evidence {
                article: &news,
                category: Some(Category::Semiconductor),
            }],
        )
        .await;
    assert_eq!(report.became_due, vec![id]);
    assert!(report.resolved.is_empty());
    assert_eq!(report.still_due, vec![id]);
    assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Due);
}
