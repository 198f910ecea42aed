//! Groups the day's articles into event clusters.
//!
//! Every pair of articles inside the time window is scored; linkable pairs are
//! merged in a disjoint set keyed by article id, so the resulting partition
//! does not depend on input order and is transitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::config::ClusteringSettings;
use crate::models::Article;
use crate::text;

/// Union-find over article ids with path compression and union by rank.
#[derive(Debug, Clone, Default)]
pub struct DisjointSet {
    index: HashMap<String, usize>,
    ids: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for id in ids {
            set.add(id);
        }
        set
    }

    /// Add a singleton. Re-adding an existing id does nothing.
    pub fn add(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.index.contains_key(&id) {
            return;
        }
        let i = self.ids.len();
        self.index.insert(id.clone(), i);
        self.ids.push(id);
        self.parent.push(i);
        self.rank.push(0);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn root(&mut self, mut i: usize) -> usize {
        let mut top = i;
        while self.parent[top] != top {
            top = self.parent[top];
        }
        while self.parent[i] != top {
            let next = self.parent[i];
            self.parent[i] = top;
            i = next;
        }
        top
    }

    /// Representative id of the set containing `id`.
    pub fn find(&mut self, id: &str) -> Option<String> {
        let i = *self.index.get(id)?;
        let root = self.root(i);
        Some(self.ids[root].clone())
    }

    /// Merge the sets of `a` and `b`. Returns false if either id is unknown or
    /// they were already joined.
    pub fn union(&mut self, a: &str, b: &str) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        let (ra, rb) = (self.root(ia), self.root(ib));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    pub fn connected(&mut self, a: &str, b: &str) -> bool {
        match (self.find(a), self.find(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// All sets, members in insertion order, sets ordered by first member.
    pub fn groups(&mut self) -> Vec<Vec<String>> {
        let mut slot: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<String>> = Vec::new();
        for i in 0..self.ids.len() {
            let root = self.root(i);
            let g = *slot.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[g].push(self.ids[i].clone());
        }
        groups
    }
}

/// Articles judged to report the same event, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    /// Discovery order: the order the articles were handed to the clusterer.
    pub member_article_ids: Vec<String>,
}

struct Features {
    tokens: BTreeSet<String>,
    entities: BTreeSet<String>,
    published_at: DateTime<Utc>,
    degraded: bool,
}

pub struct SimilarityClusterer {
    settings: ClusteringSettings,
    entity_terms: Vec<String>,
}

impl SimilarityClusterer {
    pub fn new(settings: &ClusteringSettings) -> Self {
        Self {
            entity_terms: settings.entity_terms.clone(),
            settings: settings.clone(),
        }
    }

    /// Additional names recognised as entities, e.g. the key-person registry.
    pub fn with_entity_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_terms.extend(terms.into_iter().map(Into::into));
        self
    }

    fn features(&self, article: &Article) -> Features {
        let lead = text::lead_sentence(&article.normalized_excerpt);
        let tokens = text::tokens(&format!("{} {}", article.normalized_title, lead));

        let mut entities = BTreeSet::new();
        let original_lead = text::lead_sentence(&article.body_excerpt);
        for source in [
            article.title.as_str(),
            original_lead,
            article.normalized_title.as_str(),
            lead,
        ] {
            entities.extend(text::named_terms(source));
            for term in &self.entity_terms {
                if text::contains_term(source, term) {
                    entities.insert(term.to_lowercase());
                }
            }
        }

        Features {
            tokens,
            entities,
            published_at: article.published_at,
            degraded: article.translation_degraded,
        }
    }

    fn score_features(&self, a: &Features, b: &Features) -> f64 {
        let window_secs = (self.settings.window_hours * 3600) as f64;
        let gap_secs = (a.published_at - b.published_at).num_seconds().abs() as f64;
        if gap_secs > window_secs {
            return 0.0;
        }

        let s = &self.settings;
        let lexical = text::jaccard(&a.tokens, &b.tokens);
        let entity = text::overlap_coefficient(&a.entities, &b.entities);
        let content = (s.lexical_weight * lexical + s.entity_weight * entity)
            / (s.lexical_weight + s.entity_weight);
        let proximity = 1.0 - gap_secs / window_secs;
        let mut score = content * ((1.0 - s.temporal_weight) + s.temporal_weight * proximity);

        if a.degraded || b.degraded {
            score *= s.degraded_penalty;
        }
        score
    }

    /// Pair score in [0, 1]. Zero outside the time window.
    pub fn score(&self, a: &Article, b: &Article) -> f64 {
        self.score_features(&self.features(a), &self.features(b))
    }

    pub fn linkable(&self, a: &Article, b: &Article) -> bool {
        self.score(a, b) >= self.settings.threshold
    }

    /// Partition `articles` into clusters. Members keep the order they were
    /// handed in. Cluster ids are derived from the smallest member id and
    /// clusters are ordered by earliest publication, so the partition does not
    /// depend on input order.
    pub fn cluster(&self, articles: &[Article]) -> Vec<Cluster> {
        let features: Vec<Features> = articles.iter().map(|a| self.features(a)).collect();
        let mut set = DisjointSet::new(articles.iter().map(|a| a.id.clone()));

        let mut links = 0usize;
        for i in 0..articles.len() {
            for j in (i + 1)..articles.len() {
                let score = self.score_features(&features[i], &features[j]);
                if score >= self.settings.threshold {
                    debug!(a = %articles[i].id, b = %articles[j].id, score, "linked");
                    set.union(&articles[i].id, &articles[j].id);
                    links += 1;
                }
            }
        }

        let published: HashMap<&str, DateTime<Utc>> = articles
            .iter()
            .map(|a| (a.id.as_str(), a.published_at))
            .collect();

        let mut clusters: Vec<(DateTime<Utc>, Cluster)> = set
            .groups()
            .into_iter()
            .map(|members| {
                let min_id = members.iter().min().cloned().unwrap_or_default();
                let earliest = members
                    .iter()
                    .filter_map(|id| published.get(id.as_str()).copied())
                    .min()
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                (
                    earliest,
                    Cluster {
                        cluster_id: format!("c-{}", min_id),
                        member_article_ids: members,
                    },
                )
            })
            .collect();
        clusters.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.cluster_id.cmp(&b.cluster_id)));

        info!(
            articles = articles.len(),
            links,
            clusters = clusters.len(),
            "clustering complete"
        );
        clusters.into_iter().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    fn article(id: &str, title: &str, hour: u32) -> Article {
        Article::new(id, title, "", "src", at(hour), format!("https://x.test/{}", id))
    }

    fn clusterer(threshold: f64) -> SimilarityClusterer {
        SimilarityClusterer::new(&ClusteringSettings {
            threshold,
            ..ClusteringSettings::default()
        })
    }

    #[test]
    fn test_disjoint_set_union_and_groups() {
        let mut set = DisjointSet::new(["a", "b", "c", "d"]);
        assert!(set.union("a", "b"));
        assert!(!set.union("b", "a"));
        assert!(set.union("c", "b"));
        assert!(!set.union("a", "zzz"));
        assert!(set.connected("a", "c"));
        assert!(!set.connected("a", "d"));
        assert_eq!(
            set.groups(),
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["d".to_string()]
            ]
        );
    }

    #[test]
    fn test_same_event_scores_above_unrelated() {
        let c = clusterer(0.45);
        let a = article("a", "Nvidia unveils Blackwell chip", 9);
        let b = article("b", "Nvidia reveals new Blackwell chip, details on power draw", 11);
        let z = article("z", "Tesla recalls Model Y over seat belts", 10);
        assert!(c.linkable(&a, &b));
        assert!(!c.linkable(&a, &z));
        assert!((c.score(&a, &b) - c.score(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn test_outside_window_never_links() {
        let c = SimilarityClusterer::new(&ClusteringSettings {
            window_hours: 1,
            ..ClusteringSettings::default()
        });
        let a = article("a", "Nvidia unveils Blackwell chip", 9);
        let b = article("b", "Nvidia unveils Blackwell chip", 12);
        assert_eq!(c.score(&a, &b), 0.0);
    }

    #[test]
    fn test_degraded_translation_lowers_score() {
        let c = clusterer(0.45);
        let a = article("a", "Nvidia unveils Blackwell chip", 9);
        let mut b = article("b", "Nvidia unveils Blackwell chip", 9);
        let full = c.score(&a, &b);
        b.translation_degraded = true;
        assert!((c.score(&a, &b) - full * 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_configured_entity_terms_match_cjk() {
        let c = clusterer(0.3).with_entity_terms(["华为"]);
        let a = article("a", "华为发布麒麟芯片", 9);
        let b = article("b", "华为新款麒麟芯片亮相", 10);
        assert!(c.linkable(&a, &b));
    }

    #[test]
    fn test_transitive_chain_forms_one_cluster() {
        let c = clusterer(0.45);
        let articles = vec![
            article("a", "Nvidia unveils Blackwell chip", 9),
            article("b", "Nvidia Blackwell chip power draw detailed", 10),
            article("x", "Tesla recalls Model Y", 10),
            article("c", "Blackwell power draw worries data centers", 11),
        ];
        let clusters = c.cluster(&articles);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cluster_id, "c-a");
        assert_eq!(clusters[0].member_article_ids, vec!["a", "b", "c"]);
        assert_eq!(clusters[1].member_article_ids, vec!["x"]);
    }

    #[test]
    fn test_input_order_does_not_change_partition() {
        let c = clusterer(0.45);
        let articles = vec![
            article("a", "Nvidia unveils Blackwell chip", 9),
            article("b", "Nvidia Blackwell chip power draw detailed", 10),
            article("x", "Tesla recalls Model Y", 10),
            article("c", "Blackwell power draw worries data centers", 11),
        ];
        let partition = |clusters: Vec<Cluster>| -> Vec<(String, BTreeSet<String>)> {
            clusters
                .into_iter()
                .map(|c| (c.cluster_id, c.member_article_ids.into_iter().collect()))
                .collect()
        };
        let expected = partition(c.cluster(&articles));
        for rotation in 1..articles.len() {
            let mut permuted = articles.clone();
            permuted.rotate_left(rotation);
            permuted.reverse();
            assert_eq!(partition(c.cluster(&permuted)), expected);
        }
    }

    #[test]
    fn test_members_keep_discovery_order() {
        let c = clusterer(0.45);
        let articles = vec![
            article("zz", "Nvidia unveils Blackwell chip", 1),
            article("aa", "Nvidia reveals new Blackwell chip, details on power draw", 2),
        ];
        let clusters = c.cluster(&articles);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cluster_id, "c-aa");
        assert_eq!(clusters[0].member_article_ids, vec!["zz", "aa"]);

        let reversed: Vec<Article> = articles.iter().rev().cloned().collect();
        let clusters = c.cluster(&reversed);
        assert_eq!(clusters[0].cluster_id, "c-aa");
        assert_eq!(clusters[0].member_article_ids, vec!["aa", "zz"]);
    }

    #[test]
    fn test_singletons_are_clusters() {
        let clusters = clusterer(0.45).cluster(&[article("only", "Lone story", 9)]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_article_ids, vec!["only"]);
    }
}
