//! Puts the day's resolved, classified clusters, key-person statements and
//! prediction updates into one ordered [`Briefing`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::classifier::ClusterClassification;
use crate::config::{BriefingSettings, KeyPeopleMode};
use crate::ledger::PredictionLedger;
use crate::models::{Article, Category};
use crate::people::KeyPersonMention;
use crate::prediction::{Horizon, Prediction, PredictionStatus, TrackerReport, Verdict};
use crate::resolver::{EventCluster, FollowUpOutcome};
use crate::store::ArticleStore;

pub const BRIEFING_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRef {
    pub article_id: String,
    /// Title in the briefing language.
    pub title: String,
    /// Source-language title when it differs.
    #[serde(default)]
    pub original_title: Option<String>,
    pub excerpt: String,
    pub source_name: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

impl ArticleRef {
    fn from_article(article: &Article) -> Self {
        Self {
            article_id: article.id.clone(),
            title: article.normalized_title.clone(),
            original_title: (article.title != article.normalized_title).then(|| article.title.clone()),
            excerpt: article.normalized_excerpt.clone(),
            source_name: article.source_name.clone(),
            url: article.url.clone(),
            published_at: article.published_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub article: ArticleRef,
    pub outcome: FollowUpOutcome,
    pub detail: String,
}

/// One event: the first report plus the follow-ups worth reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BriefingItem {
    pub cluster_id: String,
    pub representative: ArticleRef,
    pub followups: Vec<FollowUp>,
    /// Every category seen among retained members, primary first.
    pub categories: Vec<Category>,
    pub dropped_followups: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// `None` is the uncategorized bucket.
    pub category: Option<Category>,
    pub items: Vec<BriefingItem>,
    /// Key-person statements shown in this section.
    #[serde(default)]
    pub mentions: Vec<KeyPersonMention>,
}

impl Section {
    pub fn heading(&self) -> String {
        match self.category {
            Some(c) => format!("{} {}", c.icon(), c.display_name()),
            None => "🗂️ 未分类".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.mentions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEntry {
    pub prediction_id: String,
    pub domain: Category,
    #[serde(default)]
    pub subdomain: Option<String>,
    pub horizon: Horizon,
    pub created_at: NaiveDate,
    pub due_at: NaiveDate,
    pub statement: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub evidence_article_ids: Vec<String>,
    /// Statement of the prediction this one replaces.
    #[serde(default)]
    pub previous_statement: Option<String>,
    /// Why the outlook moved away from the previous statement.
    #[serde(default)]
    pub change_reason: Option<String>,
}

impl PredictionEntry {
    fn from_prediction(prediction: &Prediction, ledger: &PredictionLedger) -> Self {
        let resolution = prediction.resolution();
        Self {
            prediction_id: prediction.prediction_id.clone(),
            domain: prediction.domain,
            subdomain: prediction.subdomain.clone(),
            horizon: prediction.horizon,
            created_at: prediction.created_at,
            due_at: prediction.due_at,
            statement: prediction.statement_text.clone(),
            status: prediction.status(),
            verdict: resolution.map(|r| r.verdict),
            rationale: resolution.map(|r| r.rationale.clone()),
            evidence_article_ids: resolution
                .map(|r| r.evidence_article_ids.clone())
                .unwrap_or_default(),
            previous_statement: prediction
                .supersedes
                .as_deref()
                .and_then(|id| ledger.get(id))
                .map(|p| p.statement_text.clone()),
            change_reason: prediction.change_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionDigest {
    /// Due and still waiting for evidence.
    pub due: Vec<PredictionEntry>,
    pub resolved: Vec<PredictionEntry>,
    pub expired: Vec<PredictionEntry>,
    /// Created today for a slot that had no earlier prediction.
    pub new: Vec<PredictionEntry>,
    /// Created today, replacing an earlier prediction for the same slot.
    pub revised: Vec<PredictionEntry>,
}

impl PredictionDigest {
    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
            && self.resolved.is_empty()
            && self.expired.is_empty()
            && self.new.is_empty()
            && self.revised.is_empty()
    }
}

/// Collection-side counts the pipeline knows before assembly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collected_payloads: usize,
    pub failed_sources: Vec<String>,
    pub dropped_payloads: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BriefingStats {
    pub collected_payloads: usize,
    pub failed_sources: Vec<String>,
    pub dropped_payloads: usize,
    pub articles: usize,
    pub clusters: usize,
    pub retained_articles: usize,
    pub dropped_followups: usize,
    pub uncategorized: usize,
    pub mentions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub category: Category,
    pub article_id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Briefing {
    pub version: String,
    pub title: String,
    pub run_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub stats: BriefingStats,
    pub headlines: Vec<Headline>,
    pub sections: Vec<Section>,
    /// Dedicated key-person section; empty when statements are shown inline.
    #[serde(default)]
    pub key_people: Vec<KeyPersonMention>,
    pub predictions: PredictionDigest,
    /// Every article of the run, including dropped follow-ups.
    pub articles: Vec<Article>,
}

impl Briefing {
    pub fn section(&self, category: Option<Category>) -> Option<&Section> {
        self.sections.iter().find(|s| s.category == category)
    }

    pub fn article(&self, id: &str) -> Option<&Article> {
        self.articles.iter().find(|a| a.id == id)
    }
}

pub struct AssemblyInput<'a> {
    pub run_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub store: &'a ArticleStore,
    pub clusters: &'a [EventCluster],
    pub classifications: &'a [ClusterClassification],
    pub mentions: &'a [KeyPersonMention],
    pub ledger: &'a PredictionLedger,
    pub tracker: &'a TrackerReport,
    pub collection: CollectionStats,
}

pub struct BriefingAssembler {
    settings: BriefingSettings,
}

impl BriefingAssembler {
    pub fn new(settings: BriefingSettings) -> Self {
        Self { settings }
    }

    /// Configured order, then any category it leaves out.
    fn category_order(&self) -> Vec<Category> {
        let mut order = self.settings.display_order.clone();
        for c in Category::ALL {
            if !order.contains(&c) {
                order.push(c);
            }
        }
        order
    }

    fn item(
        &self,
        cluster: &EventCluster,
        classification: Option<&ClusterClassification>,
        store: &ArticleStore,
    ) -> Option<BriefingItem> {
        let representative = store.get(&cluster.representative_article_id)?;
        let followups = cluster
            .followup_ids()
            .iter()
            .filter_map(|id| {
                let article = store.get(id)?;
                let assessment = cluster.assessment(id)?;
                Some(FollowUp {
                    article: ArticleRef::from_article(article),
                    outcome: assessment.outcome,
                    detail: assessment.detail.clone(),
                })
            })
            .collect();

        let mut categories = Vec::new();
        if let Some(c) = classification {
            categories.extend(c.primary);
            categories.extend(c.categories.iter().copied().filter(|x| Some(*x) != c.primary));
        }

        Some(BriefingItem {
            cluster_id: cluster.cluster_id.clone(),
            representative: ArticleRef::from_article(representative),
            followups,
            categories,
            dropped_followups: cluster.dropped_count(),
        })
    }

    fn predictions(&self, ledger: &PredictionLedger, tracker: &TrackerReport) -> PredictionDigest {
        let entries = |ids: &[String]| -> Vec<PredictionEntry> {
            ids.iter()
                .filter_map(|id| ledger.get(id))
                .map(|p| PredictionEntry::from_prediction(p, ledger))
                .collect()
        };
        let (revised, new): (Vec<PredictionEntry>, Vec<PredictionEntry>) = entries(&tracker.created)
            .into_iter()
            .partition(|e| e.previous_statement.is_some());

        PredictionDigest {
            due: entries(&tracker.still_due),
            resolved: entries(&tracker.resolved),
            expired: entries(&tracker.expired),
            new,
            revised,
        }
    }

    pub fn assemble(&self, input: AssemblyInput<'_>) -> Briefing {
        let by_cluster: HashMap<&str, &ClusterClassification> = input
            .classifications
            .iter()
            .map(|c| (c.cluster_id.as_str(), c))
            .collect();

        let mut buckets: BTreeMap<Option<Category>, Vec<BriefingItem>> = BTreeMap::new();
        let mut placement: HashMap<&str, Option<Category>> = HashMap::new();
        for cluster in input.clusters {
            let classification = by_cluster.get(cluster.cluster_id.as_str()).copied();
            let primary = classification.and_then(|c| c.primary);
            let Some(item) = self.item(cluster, classification, input.store) else {
                continue;
            };
            for id in &cluster.retained_member_ids {
                placement.insert(id.as_str(), primary);
            }
            buckets.entry(primary).or_default().push(item);
        }

        let uncategorized = buckets.get(&None).map(Vec::len).unwrap_or(0);
        let inline = self.settings.key_people == KeyPeopleMode::Inline;
        let mut inline_mentions: BTreeMap<Option<Category>, Vec<KeyPersonMention>> = BTreeMap::new();
        if inline {
            for mention in input.mentions {
                let category = placement.get(mention.article_id.as_str()).copied().flatten();
                inline_mentions.entry(category).or_default().push(mention.clone());
            }
        }

        let mut sections = Vec::new();
        let order: Vec<Option<Category>> = self
            .category_order()
            .into_iter()
            .map(Some)
            .chain(std::iter::once(None))
            .collect();
        for category in order {
            let mut items = buckets.remove(&category).unwrap_or_default();
            if let (Some(max), Some(_)) = (self.settings.max_clusters_per_category, category) {
                items.truncate(max);
            }
            let section = Section {
                category,
                items,
                mentions: inline_mentions.remove(&category).unwrap_or_default(),
            };
            if !section.is_empty() {
                sections.push(section);
            }
        }

        let headlines = sections
            .iter()
            .filter_map(|s| {
                let category = s.category?;
                let first = s.items.first()?;
                Some(Headline {
                    category,
                    article_id: first.representative.article_id.clone(),
                    title: first.representative.title.clone(),
                    url: first.representative.url.clone(),
                })
            })
            .collect();

        let stats = BriefingStats {
            collected_payloads: input.collection.collected_payloads,
            failed_sources: input.collection.failed_sources,
            dropped_payloads: input.collection.dropped_payloads,
            articles: input.store.len(),
            clusters: input.clusters.len(),
            retained_articles: input.clusters.iter().map(|c| c.retained_member_ids.len()).sum(),
            dropped_followups: input.clusters.iter().map(|c| c.dropped_count()).sum(),
            uncategorized,
            mentions: input.mentions.len(),
        };

        let predictions = self.predictions(input.ledger, input.tracker);
        info!(
            sections = sections.len(),
            clusters = stats.clusters,
            retained = stats.retained_articles,
            predictions_due = predictions.due.len(),
            predictions_new = predictions.new.len() + predictions.revised.len(),
            "briefing assembled"
        );

        Briefing {
            version: BRIEFING_VERSION.to_string(),
            title: self.settings.title.clone(),
            run_date: input.run_date,
            generated_at: input.generated_at,
            stats,
            headlines,
            sections,
            key_people: if inline { Vec::new() } else { input.mentions.to_vec() },
            predictions,
            articles: input.store.articles().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, ClassificationMethod};
    use crate::people::MentionMethod;
    use crate::resolver::FollowUpAssessment;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    fn article(id: &str, hour: u32) -> Article {
        Article::new(
            id,
            format!("title {}", id),
            "excerpt",
            "TC",
            Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap(),
            format!("https://x.test/{}", id),
        )
    }

    fn cluster(rep: &str, retained: &[&str], dropped: &[&str]) -> EventCluster {
        let mut members = vec![rep.to_string()];
        members.extend(retained.iter().map(|s| s.to_string()));
        members.extend(dropped.iter().map(|s| s.to_string()));
        let mut assessments: Vec<FollowUpAssessment> = retained
            .iter()
            .map(|id| FollowUpAssessment {
                article_id: id.to_string(),
                outcome: FollowUpOutcome::NewFigure,
                detail: "15 w".to_string(),
            })
            .collect();
        assessments.extend(dropped.iter().map(|id| FollowUpAssessment {
            article_id: id.to_string(),
            outcome: FollowUpOutcome::Redundant,
            detail: String::new(),
        }));
        let mut retained_ids = vec![rep.to_string()];
        retained_ids.extend(retained.iter().map(|s| s.to_string()));
        EventCluster {
            cluster_id: format!("c-{}", rep),
            member_article_ids: members,
            representative_article_id: rep.to_string(),
            retained_member_ids: retained_ids,
            assessments,
        }
    }

    fn classified(cluster: &EventCluster, category: Option<Category>) -> ClusterClassification {
        ClusterClassification {
            cluster_id: cluster.cluster_id.clone(),
            primary: category,
            categories: category.into_iter().collect::<BTreeSet<_>>(),
            members: vec![Classification {
                article_id: cluster.representative_article_id.clone(),
                category,
                method: ClassificationMethod::Rules,
                confidence: 1.0,
            }],
        }
    }

    fn mention(article_id: &str) -> KeyPersonMention {
        KeyPersonMention {
            person_id: "jensen-huang".to_string(),
            person_name: "Jensen Huang".to_string(),
            article_id: article_id.to_string(),
            quote_text: "demand is insane".to_string(),
            confidence: 0.9,
            method: MentionMethod::Quote,
        }
    }

    fn assemble(settings: BriefingSettings, mentions: &[KeyPersonMention]) -> Briefing {
        let store = ArticleStore::from_articles(vec![
            article("a", 9),
            article("a2", 10),
            article("a3", 10),
            article("b", 8),
            article("u", 7),
        ])
        .unwrap();
        let clusters = vec![cluster("u", &[], &[]), cluster("b", &[], &[]), cluster("a", &["a2"], &["a3"])];
        let classifications = vec![
            classified(&clusters[0], None),
            classified(&clusters[1], Some(Category::Auto)),
            classified(&clusters[2], Some(Category::Ai)),
        ];
        let ledger = PredictionLedger::new();
        let tracker = TrackerReport::default();
        BriefingAssembler::new(settings).assemble(AssemblyInput {
            run_date: day(),
            generated_at: Utc.with_ymd_and_hms(2026, 1, 2, 1, 0, 0).unwrap(),
            store: &store,
            clusters: &clusters,
            classifications: &classifications,
            mentions,
            ledger: &ledger,
            tracker: &tracker,
            collection: CollectionStats {
                collected_payloads: 7,
                failed_sources: vec!["Nikkei Asia".to_string()],
                dropped_payloads: 2,
            },
        })
    }

    #[test]
    fn test_sections_follow_display_order_with_uncategorized_last() {
        let settings = BriefingSettings {
            display_order: vec![Category::Auto, Category::Ai],
            ..BriefingSettings::default()
        };
        let briefing = assemble(settings, &[]);
        let order: Vec<Option<Category>> = briefing.sections.iter().map(|s| s.category).collect();
        assert_eq!(order, vec![Some(Category::Auto), Some(Category::Ai), None]);
        assert_eq!(briefing.headlines.len(), 2);
        assert_eq!(briefing.headlines[0].article_id, "b");
    }

    #[test]
    fn test_items_carry_retained_followups_only() {
        let briefing = assemble(BriefingSettings::default(), &[]);
        let ai = briefing.section(Some(Category::Ai)).unwrap();
        let item = &ai.items[0];
        assert_eq!(item.representative.article_id, "a");
        assert_eq!(item.followups.len(), 1);
        assert_eq!(item.followups[0].article.article_id, "a2");
        assert_eq!(item.dropped_followups, 1);

        assert_eq!(briefing.stats.articles, 5);
        assert_eq!(briefing.stats.retained_articles, 4);
        assert_eq!(briefing.stats.dropped_followups, 1);
        assert_eq!(briefing.stats.uncategorized, 1);
        assert_eq!(briefing.articles.len(), 5);
        assert_eq!(briefing.version, BRIEFING_VERSION);
    }

    #[test]
    fn test_key_people_dedicated_or_inline() {
        let mentions = [mention("a2")];
        let dedicated = assemble(BriefingSettings::default(), &mentions);
        assert_eq!(dedicated.key_people.len(), 1);
        assert!(dedicated.sections.iter().all(|s| s.mentions.is_empty()));

        let inline = assemble(
            BriefingSettings {
                key_people: KeyPeopleMode::Inline,
                ..BriefingSettings::default()
            },
            &mentions,
        );
        assert!(inline.key_people.is_empty());
        assert_eq!(inline.section(Some(Category::Ai)).unwrap().mentions.len(), 1);
    }

    #[test]
    fn test_max_clusters_per_category() {
        let settings = BriefingSettings {
            max_clusters_per_category: Some(0),
            ..BriefingSettings::default()
        };
        let briefing = assemble(settings, &[]);
        let categories: Vec<Option<Category>> = briefing.sections.iter().map(|s| s.category).collect();
        assert_eq!(categories, vec![None]);
    }

    #[test]
    fn test_created_predictions_split_into_new_and_revised() {
        let mut ledger = PredictionLedger::new();
        let old = Prediction::new(Category::Ai, Horizon::Week, day(), "old outlook");
        let mut revised = Prediction::new(Category::Ai, Horizon::Week, NaiveDate::from_ymd_opt(2026, 1, 8).unwrap(), "new outlook");
        revised.supersedes = Some(old.prediction_id.clone());
        revised.change_reason = Some("new fabs came online".to_string());
        let fresh = Prediction::new(Category::Auto, Horizon::Year, day(), "robotaxis expand");
        let ids = vec![revised.prediction_id.clone(), fresh.prediction_id.clone()];
        ledger.insert(old).unwrap();
        ledger.insert(revised).unwrap();
        ledger.insert(fresh).unwrap();

        let tracker = TrackerReport {
            created: ids,
            ..TrackerReport::default()
        };
        let digest = BriefingAssembler::new(BriefingSettings::default()).predictions(&ledger, &tracker);
        assert_eq!(digest.new.len(), 1);
        assert_eq!(digest.revised.len(), 1);
        assert_eq!(digest.revised[0].previous_statement.as_deref(), Some("old outlook"));
        assert_eq!(digest.revised[0].change_reason.as_deref(), Some("new fabs came online"));
        assert_eq!(digest.new[0].change_reason, None);
    }
}
