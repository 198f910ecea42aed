//! Picks each cluster's first report and decides which follow-ups add enough
//! to keep.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clustering::Cluster;
use crate::config::ResolverSettings;
use crate::error::JudgmentError;
use crate::llm::{Judge, JudgmentKind, JudgmentPrompt};
use crate::models::Article;
use crate::people::attributed_speakers;
use crate::store::ArticleStore;
use crate::text;

/// Why a follow-up was kept or left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpOutcome {
    NewFigure,
    NewQuote,
    NewAngle,
    /// Too little text not already in the representative.
    Redundant,
    /// The LLM judged it adds nothing material.
    NotSignificant,
    /// The LLM could not be asked or did not answer; dropped conservatively.
    Undetermined,
    /// Significant, but the cluster already keeps the maximum number of follow-ups.
    OverCap,
}

impl FollowUpOutcome {
    pub fn is_retained(&self) -> bool {
        matches!(
            self,
            FollowUpOutcome::NewFigure | FollowUpOutcome::NewQuote | FollowUpOutcome::NewAngle
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FollowUpOutcome::NewFigure => "新数据",
            FollowUpOutcome::NewQuote => "新表态",
            FollowUpOutcome::NewAngle => "新角度",
            FollowUpOutcome::Redundant => "重复",
            FollowUpOutcome::NotSignificant => "无新增",
            FollowUpOutcome::Undetermined => "未判定",
            FollowUpOutcome::OverCap => "超出上限",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpAssessment {
    pub article_id: String,
    pub outcome: FollowUpOutcome,
    /// The new figure, speaker or angle, or why it was dropped.
    pub detail: String,
}

/// A resolved cluster. Members that were not retained stay listed for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCluster {
    pub cluster_id: String,
    pub member_article_ids: Vec<String>,
    pub representative_article_id: String,
    /// Representative first, then retained follow-ups.
    pub retained_member_ids: Vec<String>,
    pub assessments: Vec<FollowUpAssessment>,
}

impl EventCluster {
    pub fn followup_ids(&self) -> &[String] {
        &self.retained_member_ids[1..]
    }

    pub fn dropped_count(&self) -> usize {
        self.member_article_ids.len() - self.retained_member_ids.len()
    }

    pub fn assessment(&self, article_id: &str) -> Option<&FollowUpAssessment> {
        self.assessments.iter().find(|a| a.article_id == article_id)
    }
}

/// Does a follow-up add a material fact, figure or viewpoint?
pub struct SignificanceRequest {
    pub representative_title: String,
    pub representative_excerpt: String,
    pub candidate_title: String,
    pub candidate_excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceJudgment {
    pub significant: bool,
    /// new_figure, new_quote or new_angle when significant.
    #[serde(default)]
    pub kind: Option<FollowUpOutcome>,
    #[serde(default)]
    pub detail: String,
}

impl JudgmentPrompt for SignificanceRequest {
    const KIND: JudgmentKind = JudgmentKind::Significance;
    type Output = SignificanceJudgment;

    fn cache_material(&self) -> String {
        format!(
            "{}\n{}\n---\n{}\n{}",
            self.representative_title,
            self.representative_excerpt,
            self.candidate_title,
            self.candidate_excerpt
        )
    }

    fn system(&self) -> String {
        "You are a news editor removing duplicate coverage. Answer only with JSON.".to_string()
    }

    fn prompt(&self) -> String {
        format!(
            r#"First report:
{rt}
{re}

Later report of the same event:
{ct}
{ce}

Does the later report add a material fact, figure, named reaction or a clearly different angle
that the first report lacks? Rewording and minor details do not count.

Respond as:
{{"significant": true | false, "kind": "new_figure" | "new_quote" | "new_angle" | null, "detail": "what is new, in a few words"}}"#,
            rt = self.representative_title,
            re = self.representative_excerpt,
            ct = self.candidate_title,
            ce = self.candidate_excerpt,
        )
    }
}

enum Local {
    Decided(FollowUpOutcome, String),
    AskLlm,
}

pub struct ClusterResolver {
    settings: ResolverSettings,
    source_priority: Vec<String>,
    judge: Arc<Judge>,
    concurrency: usize,
}

impl ClusterResolver {
    pub fn new(settings: ResolverSettings, source_priority: Vec<String>, judge: Arc<Judge>) -> Self {
        Self {
            settings,
            source_priority,
            judge,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn priority_rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.source_priority.len())
    }

    /// Earliest first, then configured source priority, then id.
    fn report_order(&self, a: &Article, b: &Article) -> Ordering {
        a.published_at
            .cmp(&b.published_at)
            .then_with(|| self.priority_rank(&a.source_name).cmp(&self.priority_rank(&b.source_name)))
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn representative<'a>(&self, members: &[&'a Article]) -> Option<&'a Article> {
        members.iter().copied().min_by(|a, b| self.report_order(a, b))
    }

    /// Conclusive local decisions; `AskLlm` when the heuristics cannot tell.
    fn assess_locally(&self, representative: &Article, candidate: &Article) -> Local {
        let rep_text = representative.searchable_text();
        let cand_text = candidate.searchable_text();

        let new_figures: Vec<String> = text::figures(&cand_text)
            .difference(&text::figures(&rep_text))
            .cloned()
            .collect();
        if !new_figures.is_empty() {
            return Local::Decided(FollowUpOutcome::NewFigure, new_figures.join(", "));
        }

        let new_speakers: Vec<String> = attributed_speakers(&cand_text)
            .into_iter()
            .filter(|s| !text::contains_term(&rep_text, s))
            .collect();
        if !new_speakers.is_empty() {
            return Local::Decided(FollowUpOutcome::NewQuote, new_speakers.join(", "));
        }

        let novelty = text::novelty(
            &text::tokens(&candidate.matching_text()),
            &text::tokens(&representative.matching_text()),
        );
        if novelty < self.settings.novelty_floor {
            return Local::Decided(
                FollowUpOutcome::Redundant,
                format!("novelty {:.2} below {:.2}", novelty, self.settings.novelty_floor),
            );
        }
        Local::AskLlm
    }

    pub async fn resolve(&self, clusters: &[Cluster], store: &ArticleStore) -> Vec<EventCluster> {
        // First pass: representative and local decisions per cluster.
        let mut staged: Vec<(EventCluster, Vec<(String, Local)>)> = Vec::new();
        let mut questions: Vec<(usize, String, SignificanceRequest)> = Vec::new();

        for cluster in clusters {
            let members: Vec<&Article> = cluster
                .member_article_ids
                .iter()
                .filter_map(|id| store.get(id))
                .collect();
            let Some(rep) = self.representative(&members) else {
                warn!(cluster = %cluster.cluster_id, "cluster has no stored members, skipping");
                continue;
            };

            let mut followups: Vec<&Article> = members.iter().copied().filter(|a| a.id != rep.id).collect();
            followups.sort_by(|a, b| self.report_order(a, b));

            let mut local = Vec::new();
            for candidate in followups {
                let decision = self.assess_locally(rep, candidate);
                if matches!(decision, Local::AskLlm) {
                    questions.push((
                        staged.len(),
                        candidate.id.clone(),
                        SignificanceRequest {
                            representative_title: rep.normalized_title.clone(),
                            representative_excerpt: rep.normalized_excerpt.clone(),
                            candidate_title: candidate.normalized_title.clone(),
                            candidate_excerpt: candidate.normalized_excerpt.clone(),
                        },
                    ));
                }
                local.push((candidate.id.clone(), decision));
            }

            staged.push((
                EventCluster {
                    cluster_id: cluster.cluster_id.clone(),
                    member_article_ids: cluster.member_article_ids.clone(),
                    representative_article_id: rep.id.clone(),
                    retained_member_ids: vec![rep.id.clone()],
                    assessments: Vec::new(),
                },
                local,
            ));
        }

        // LLM questions run concurrently; answers are matched back by id.
        let answers: Vec<(usize, String, (FollowUpOutcome, String))> = stream::iter(questions)
            .map(|(ci, article_id, request)| async move {
                let outcome = match self.judge.judge(&request).await {
                    Ok(SignificanceJudgment {
                        significant: true,
                        kind,
                        detail,
                    }) => {
                        let kind = kind.filter(|k| k.is_retained()).unwrap_or(FollowUpOutcome::NewAngle);
                        (kind, detail)
                    }
                    Ok(judgment) => (FollowUpOutcome::NotSignificant, judgment.detail),
                    Err(JudgmentError::Unavailable) => {
                        debug!(article = %article_id, "no LLM for significance, dropping follow-up");
                        (FollowUpOutcome::Undetermined, "no LLM available".to_string())
                    }
                    Err(e) => {
                        warn!(article = %article_id, error = %e, "significance judgment failed, dropping follow-up");
                        (FollowUpOutcome::Undetermined, e.to_string())
                    }
                };
                (ci, article_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut resolved = Vec::with_capacity(staged.len());
        for (ci, (mut event, local)) in staged.into_iter().enumerate() {
            let mut kept = 0usize;
            for (article_id, decision) in local {
                let (mut outcome, detail) = match decision {
                    Local::Decided(outcome, detail) => (outcome, detail),
                    Local::AskLlm => answers
                        .iter()
                        .find(|(i, id, _)| *i == ci && *id == article_id)
                        .map(|(_, _, answer)| answer.clone())
                        .unwrap_or((FollowUpOutcome::Undetermined, String::new())),
                };
                if outcome.is_retained() {
                    if kept < self.settings.max_followups {
                        kept += 1;
                        event.retained_member_ids.push(article_id.clone());
                    } else {
                        outcome = FollowUpOutcome::OverCap;
                    }
                }
                event.assessments.push(FollowUpAssessment {
                    article_id,
                    outcome,
                    detail,
                });
            }
            debug!(
                cluster = %event.cluster_id,
                members = event.member_article_ids.len(),
                retained = event.retained_member_ids.len(),
                "cluster resolved"
            );
            resolved.push(event);
        }

        info!(
            clusters = resolved.len(),
            retained = resolved.iter().map(|c| c.retained_member_ids.len()).sum::<usize>(),
            dropped = resolved.iter().map(|c| c.dropped_count()).sum::<usize>(),
            "resolution complete"
        );
        resolved
    }
}
