//! Forecasts carried across runs and reconciled against later news.
//!
//! A prediction is created `pending`, becomes `due` once its horizon has
//! elapsed, and ends either `resolved` with a verdict or `expired-unresolved`
//! after the grace window. Only [`PredictionTracker`] changes status.

use chrono::{Duration, Months, NaiveDate};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PredictionSettings;
use crate::error::{LedgerError, TransitionError};
use crate::ledger::PredictionLedger;
use crate::llm::{Judge, JudgmentKind, JudgmentPrompt};
use crate::models::{Article, Category};
use crate::text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "1w")]
    Week,
    #[serde(rename = "1m")]
    Month,
    #[serde(rename = "6m")]
    HalfYear,
    #[serde(rename = "1y")]
    Year,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [Horizon::Week, Horizon::Month, Horizon::HalfYear, Horizon::Year];

    pub fn id(&self) -> &'static str {
        match self {
            Horizon::Week => "1w",
            Horizon::Month => "1m",
            Horizon::HalfYear => "6m",
            Horizon::Year => "1y",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Horizon::Week => "1周",
            Horizon::Month => "1个月",
            Horizon::HalfYear => "6个月",
            Horizon::Year => "1年",
        }
    }

    /// `from` moved forward by one horizon. Month arithmetic clamps to the end
    /// of shorter months (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: NaiveDate) -> NaiveDate {
        let moved = match self {
            Horizon::Week => from.checked_add_signed(Duration::days(7)),
            Horizon::Month => from.checked_add_months(Months::new(1)),
            Horizon::HalfYear => from.checked_add_months(Months::new(6)),
            Horizon::Year => from.checked_add_months(Months::new(12)),
        };
        moved.unwrap_or(NaiveDate::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionStatus {
    Pending,
    Due,
    Resolved,
    ExpiredUnresolved,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PredictionStatus::Resolved | PredictionStatus::ExpiredUnresolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkDue,
    Resolve,
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Refuted,
    Partial,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Confirmed => "✅ 已应验",
            Verdict::Refuted => "❌ 未应验",
            Verdict::Partial => "➖ 部分应验",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub verdict: Verdict,
    pub resolved_on: NaiveDate,
    pub evidence_article_ids: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: String,
    pub domain: Category,
    #[serde(default)]
    pub subdomain: Option<String>,
    pub horizon: Horizon,
    pub created_at: NaiveDate,
    pub due_at: NaiveDate,
    pub statement_text: String,
    status: PredictionStatus,
    #[serde(default)]
    resolution: Option<Resolution>,
    #[serde(default)]
    expired_on: Option<NaiveDate>,
    /// Id of the earlier prediction for the same (domain, horizon) slot.
    #[serde(default)]
    pub supersedes: Option<String>,
    /// Why this forecast differs from the one it supersedes.
    #[serde(default)]
    pub change_reason: Option<String>,
}

impl Prediction {
    pub fn new(
        domain: Category,
        horizon: Horizon,
        created_at: NaiveDate,
        statement_text: impl Into<String>,
    ) -> Self {
        Self {
            prediction_id: format!("{}-{}-{}", domain.id(), horizon.id(), created_at),
            domain,
            subdomain: None,
            horizon,
            created_at,
            due_at: horizon.advance(created_at),
            statement_text: statement_text.into(),
            status: PredictionStatus::Pending,
            resolution: None,
            expired_on: None,
            supersedes: None,
            change_reason: None,
        }
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn expired_on(&self) -> Option<NaiveDate> {
        self.expired_on
    }

    /// Last day a due prediction may still be resolved.
    pub fn grace_end(&self, grace_days: Option<i64>) -> NaiveDate {
        match grace_days {
            Some(days) => self
                .due_at
                .checked_add_signed(Duration::days(days))
                .unwrap_or(NaiveDate::MAX),
            None => self.horizon.advance(self.due_at),
        }
    }

    fn refuse(&self, attempted: Transition) -> TransitionError {
        TransitionError {
            prediction_id: self.prediction_id.clone(),
            from: self.status,
            attempted,
        }
    }

    pub(crate) fn mark_due(&mut self) -> Result<(), TransitionError> {
        if self.status != PredictionStatus::Pending {
            return Err(self.refuse(Transition::MarkDue));
        }
        self.status = PredictionStatus::Due;
        Ok(())
    }

    pub(crate) fn resolve(&mut self, resolution: Resolution) -> Result<(), TransitionError> {
        if self.status != PredictionStatus::Due {
            return Err(self.refuse(Transition::Resolve));
        }
        self.status = PredictionStatus::Resolved;
        self.resolution = Some(resolution);
        Ok(())
    }

    pub(crate) fn expire(&mut self, on: NaiveDate) -> Result<(), TransitionError> {
        if self.status != PredictionStatus::Due {
            return Err(self.refuse(Transition::Expire));
        }
        self.status = PredictionStatus::ExpiredUnresolved;
        self.expired_on = Some(on);
        Ok(())
    }
}

/// An article from the current run, with the category it was filed under.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub article: &'a Article,
    pub category: Option<Category>,
}

/// Ask whether candidate articles confirm or refute a due prediction.
pub struct ResolutionRequest {
    pub statement: String,
    pub domain: Category,
    pub created_at: NaiveDate,
    pub due_at: NaiveDate,
    /// (article id, title, excerpt)
    pub candidates: Vec<(String, String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionJudgment {
    /// `None` when the articles do not settle the question.
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub evidence_article_ids: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

impl JudgmentPrompt for ResolutionRequest {
    const KIND: JudgmentKind = JudgmentKind::PredictionResolution;
    type Output = ResolutionJudgment;

    fn cache_material(&self) -> String {
        let mut material = format!("{}\n{}\n{}\n", self.statement, self.domain.id(), self.due_at);
        for (id, title, excerpt) in &self.candidates {
            material.push_str(&format!("{}|{}|{}\n", id, title, excerpt));
        }
        material
    }

    fn system(&self) -> String {
        "You check technology forecasts against news. Answer only with JSON.".to_string()
    }

    fn prompt(&self) -> String {
        let mut articles = String::new();
        for (id, title, excerpt) in &self.candidates {
            articles.push_str(&format!("[{}] {}\n{}\n\n", id, title, excerpt));
        }
        format!(
            r#"Forecast made on {created} about {domain}, due {due}:
"{statement}"

Recent articles:
{articles}
Decide whether these articles confirm, refute or partially confirm the forecast.
If they do not settle it, use null.

Respond as:
{{"verdict": "confirmed" | "refuted" | "partial" | null, "evidence_article_ids": ["..."], "rationale": "one sentence"}}"#,
            created = self.created_at,
            domain = self.domain.scope(),
            due = self.due_at,
            statement = self.statement,
            articles = articles,
        )
    }
}

/// Ask for a new forecast for one (domain, horizon) slot.
pub struct GenerationRequest {
    pub domain: Category,
    pub horizon: Horizon,
    pub run_date: NaiveDate,
    pub headlines: Vec<String>,
    pub previous: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPrediction {
    /// `None` when the day's news gives no basis for a forecast.
    pub statement: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
}

impl JudgmentPrompt for GenerationRequest {
    const KIND: JudgmentKind = JudgmentKind::PredictionGeneration;
    type Output = GeneratedPrediction;

    fn cache_material(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.domain.id(),
            self.horizon.id(),
            self.run_date,
            self.previous.as_deref().unwrap_or(""),
            self.headlines.join("\n")
        )
    }

    fn system(&self) -> String {
        "你是科技行业分析师，根据当日新闻做出可验证的预测。只输出JSON。".to_string()
    }

    fn prompt(&self) -> String {
        let previous = match &self.previous {
            Some(p) => format!("上一次对该领域同一时间跨度的预测：{}\n", p),
            None => String::new(),
        };
        format!(
            r#"领域：{name}（{scope}）
日期：{date}
预测时间跨度：{horizon}
{previous}
今日新闻标题：
{headlines}

请给出一条在{horizon}后可以用新闻验证的具体预测（一句话，中文）。
如果今日新闻不足以支撑预测，statement 使用 null。

输出格式：
{{"statement": "...", "subdomain": "可选的细分领域"}}"#,
            name = self.domain.display_name(),
            scope = self.domain.scope(),
            date = self.run_date,
            horizon = self.horizon.label(),
            previous = previous,
            headlines = self
                .headlines
                .iter()
                .map(|h| format!("- {}", h))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Ask why the outlook for a slot moved from one statement to another.
pub struct ChangeReasonRequest {
    pub domain: Category,
    pub horizon: Horizon,
    pub previous: String,
    pub current: String,
    pub headlines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReason {
    pub reason: String,
}

impl JudgmentPrompt for ChangeReasonRequest {
    const KIND: JudgmentKind = JudgmentKind::PredictionChange;
    type Output = ChangeReason;

    fn cache_material(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.domain.id(),
            self.horizon.id(),
            self.previous,
            self.current,
            self.headlines.join("\n")
        )
    }

    fn system(&self) -> String {
        "你是科技行业分析师，负责解释预测的调整。只输出JSON。".to_string()
    }

    fn prompt(&self) -> String {
        format!(
            r#"领域：{name}
预测时间跨度：{horizon}
此前预测：{previous}
最新预测：{current}

今日新闻标题：
{headlines}

请用一句中文说明预测为何调整。

输出格式：
{{"reason": "..."}}"#,
            name = self.domain.display_name(),
            horizon = self.horizon.label(),
            previous = self.previous,
            current = self.current,
            headlines = self
                .headlines
                .iter()
                .map(|h| format!("- {}", h))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Used when the reason for a revision cannot be obtained.
pub const FALLBACK_CHANGE_REASON: &str = "根据最新新闻动态更新";

/// What one run did to the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerReport {
    pub became_due: Vec<String>,
    pub resolved: Vec<String>,
    pub expired: Vec<String>,
    pub still_due: Vec<String>,
    pub created: Vec<String>,
}

const REFUTATION_CUES: &[&str] = &[
    "not", "no longer", "denied", "denies", "delayed", "delay", "cancel", "cancelled", "fails",
    "failed", "halted", "postponed", "worsens", "未", "没有", "推迟", "取消", "否认", "延期",
    "失败", "暂停", "恶化",
];

const MAX_HEADLINES: usize = 12;

pub struct PredictionTracker {
    settings: PredictionSettings,
    judge: Arc<Judge>,
    concurrency: usize,
}

impl PredictionTracker {
    pub fn new(settings: PredictionSettings, judge: Arc<Judge>) -> Self {
        Self {
            settings,
            judge,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Record a new pending prediction.
    pub fn add(&self, ledger: &mut PredictionLedger, prediction: Prediction) -> Result<(), LedgerError> {
        info!(
            prediction_id = %prediction.prediction_id,
            due_at = %prediction.due_at,
            "prediction created"
        );
        ledger.insert(prediction)
    }

    /// Full daily cycle: advance, reconcile, expire, then generate.
    pub async fn run(
        &self,
        ledger: &mut PredictionLedger,
        run_date: NaiveDate,
        evidence: &[Evidence<'_>],
    ) -> TrackerReport {
        let became_due = self.advance(ledger, run_date);
        let resolved = self.reconcile(ledger, run_date, evidence).await;
        let expired = self.expire(ledger, run_date);
        let still_due = ledger
            .predictions()
            .filter(|p| p.status() == PredictionStatus::Due)
            .map(|p| p.prediction_id.clone())
            .collect();
        let created = if self.settings.enabled {
            self.generate(ledger, run_date, evidence).await
        } else {
            Vec::new()
        };
        ledger.touch(run_date);

        TrackerReport {
            became_due,
            resolved,
            expired,
            still_due,
            created,
        }
    }

    /// Pending predictions whose `due_at` is on or before `run_date` become due.
    pub fn advance(&self, ledger: &mut PredictionLedger, run_date: NaiveDate) -> Vec<String> {
        let ids: Vec<String> = ledger
            .predictions()
            .filter(|p| p.status() == PredictionStatus::Pending && p.due_at <= run_date)
            .map(|p| p.prediction_id.clone())
            .collect();

        let mut changed = Vec::new();
        for id in ids {
            let Some(prediction) = ledger.get_mut(&id) else {
                continue;
            };
            match prediction.mark_due() {
                Ok(()) => {
                    info!(prediction_id = %id, due_at = %prediction.due_at, "prediction due");
                    changed.push(id);
                }
                Err(e) => warn!(error = %e, "skipping transition"),
            }
        }
        changed
    }

    /// Check every due prediction against the day's articles.
    pub async fn reconcile(
        &self,
        ledger: &mut PredictionLedger,
        run_date: NaiveDate,
        evidence: &[Evidence<'_>],
    ) -> Vec<String> {
        let due: Vec<Prediction> = ledger
            .predictions()
            .filter(|p| p.status() == PredictionStatus::Due)
            .cloned()
            .collect();

        let decisions: Vec<(String, Option<Resolution>)> = stream::iter(due)
            .map(|prediction| async move {
                let resolution = self.evaluate(&prediction, run_date, evidence).await;
                (prediction.prediction_id, resolution)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut resolved = Vec::new();
        let mut decisions = decisions;
        decisions.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, resolution) in decisions {
            let Some(resolution) = resolution else {
                continue;
            };
            let Some(prediction) = ledger.get_mut(&id) else {
                continue;
            };
            let verdict = resolution.verdict;
            match prediction.resolve(resolution) {
                Ok(()) => {
                    info!(prediction_id = %id, ?verdict, "prediction resolved");
                    resolved.push(id);
                }
                Err(e) => warn!(error = %e, "skipping transition"),
            }
        }
        resolved
    }

    async fn evaluate(
        &self,
        prediction: &Prediction,
        run_date: NaiveDate,
        evidence: &[Evidence<'_>],
    ) -> Option<Resolution> {
        let candidates = self.candidates(prediction, evidence);
        if candidates.is_empty() {
            debug!(prediction_id = %prediction.prediction_id, "no evidence today");
            return None;
        }

        let (best, coverage) = candidates[0];
        let text = best.article.searchable_text().to_lowercase();
        let has_cue = REFUTATION_CUES.iter().any(|cue| text::contains_term(&text, cue));
        if coverage >= self.settings.confirm_overlap && !has_cue {
            return Some(Resolution {
                verdict: Verdict::Confirmed,
                resolved_on: run_date,
                evidence_article_ids: vec![best.article.id.clone()],
                rationale: format!("matched by keywords: {}", best.article.title),
            });
        }

        let request = ResolutionRequest {
            statement: prediction.statement_text.clone(),
            domain: prediction.domain,
            created_at: prediction.created_at,
            due_at: prediction.due_at,
            candidates: candidates
                .iter()
                .map(|(e, _)| {
                    (
                        e.article.id.clone(),
                        e.article.normalized_title.clone(),
                        text::truncate_chars(&e.article.normalized_excerpt, 300).to_string(),
                    )
                })
                .collect(),
        };
        let known: BTreeSet<&str> = candidates.iter().map(|(e, _)| e.article.id.as_str()).collect();

        match self.judge.judge(&request).await {
            Ok(ResolutionJudgment {
                verdict: Some(verdict),
                evidence_article_ids,
                rationale,
            }) => {
                let mut ids: Vec<String> = evidence_article_ids
                    .into_iter()
                    .filter(|id| known.contains(id.as_str()))
                    .collect();
                if ids.is_empty() {
                    ids.push(best.article.id.clone());
                }
                Some(Resolution {
                    verdict,
                    resolved_on: run_date,
                    evidence_article_ids: ids,
                    rationale,
                })
            }
            Ok(_) => {
                debug!(prediction_id = %prediction.prediction_id, "evidence inconclusive");
                None
            }
            Err(e) => {
                warn!(
                    prediction_id = %prediction.prediction_id,
                    error = %e,
                    "resolution judgment failed, prediction stays due"
                );
                None
            }
        }
    }

    /// Articles sharing enough terms with the statement, best first. Articles
    /// filed under the prediction's domain rank ahead of others.
    fn candidates<'e, 'a>(
        &self,
        prediction: &Prediction,
        evidence: &'e [Evidence<'a>],
    ) -> Vec<(&'e Evidence<'a>, f64)> {
        let statement = text::tokens(&prediction.statement_text);
        if statement.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(&Evidence, f64)> = evidence
            .iter()
            .filter_map(|e| {
                let article = text::tokens(&e.article.searchable_text());
                let shared = statement.intersection(&article).count();
                let coverage = 1.0 - text::novelty(&statement, &article);
                (shared >= 2 && coverage >= self.settings.evidence_min_overlap).then_some((e, coverage))
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            let a_domain = a.category == Some(prediction.domain);
            let b_domain = b.category == Some(prediction.domain);
            b_domain
                .cmp(&a_domain)
                .then(sb.total_cmp(sa))
                .then_with(|| a.article.id.cmp(&b.article.id))
        });
        scored.truncate(self.settings.max_evidence.max(1));
        scored
    }

    /// Due predictions past their grace window expire unresolved.
    pub fn expire(&self, ledger: &mut PredictionLedger, run_date: NaiveDate) -> Vec<String> {
        let ids: Vec<String> = ledger
            .predictions()
            .filter(|p| {
                p.status() == PredictionStatus::Due && run_date > p.grace_end(self.settings.grace_days)
            })
            .map(|p| p.prediction_id.clone())
            .collect();

        let mut expired = Vec::new();
        for id in ids {
            let Some(prediction) = ledger.get_mut(&id) else {
                continue;
            };
            match prediction.expire(run_date) {
                Ok(()) => {
                    info!(prediction_id = %id, "prediction expired unresolved");
                    expired.push(id);
                }
                Err(e) => warn!(error = %e, "skipping transition"),
            }
        }
        expired
    }

    /// New pending predictions for every domain with news today and a horizon
    /// that has no pending prediction.
    pub async fn generate(
        &self,
        ledger: &mut PredictionLedger,
        run_date: NaiveDate,
        evidence: &[Evidence<'_>],
    ) -> Vec<String> {
        let mut requests = Vec::new();
        for domain in Category::ALL {
            if domain == Category::KeyPeople {
                continue;
            }
            let headlines: Vec<String> = evidence
                .iter()
                .filter(|e| e.category == Some(domain))
                .map(|e| e.article.normalized_title.clone())
                .take(MAX_HEADLINES)
                .collect();
            if headlines.is_empty() {
                continue;
            }
            for &horizon in &self.settings.horizons {
                if ledger.has_pending(domain, horizon) {
                    continue;
                }
                let previous = ledger.latest_for(domain, horizon).map(|p| p.prediction_id.clone());
                let previous_text = ledger
                    .latest_for(domain, horizon)
                    .map(|p| p.statement_text.clone());
                requests.push((
                    previous,
                    GenerationRequest {
                        domain,
                        horizon,
                        run_date,
                        headlines: headlines.clone(),
                        previous: previous_text,
                    },
                ));
            }
        }

        let mut generated: Vec<(Category, Horizon, Option<String>, GeneratedPrediction, Option<String>)> =
            stream::iter(requests)
                .map(|(previous, request)| async move {
                    let output = match self.judge.judge(&request).await {
                        Ok(output) => output,
                        Err(e) => {
                            warn!(
                                domain = request.domain.id(),
                                horizon = request.horizon.id(),
                                error = %e,
                                "prediction generation failed"
                            );
                            return None;
                        }
                    };
                    let reason = self.change_reason(&request, &output).await;
                    Some((request.domain, request.horizon, previous, output, reason))
                })
                .buffer_unordered(self.concurrency)
                .filter_map(|r| async move { r })
                .collect()
                .await;
        generated.sort_by_key(|(domain, horizon, _, _, _)| (*domain, *horizon));

        let mut created = Vec::new();
        for (domain, horizon, previous, output, reason) in generated {
            let Some(statement) = output.statement.filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            let mut prediction = Prediction::new(domain, horizon, run_date, statement.trim());
            prediction.subdomain = output.subdomain.filter(|s| !s.trim().is_empty());
            prediction.supersedes = previous;
            prediction.change_reason = reason;
            let id = prediction.prediction_id.clone();
            match self.add(ledger, prediction) {
                Ok(()) => created.push(id),
                Err(e) => warn!(error = %e, "could not record prediction"),
            }
        }
        created
    }

    /// One sentence on why a revised forecast differs from the previous one.
    /// `None` for first forecasts and unchanged statements.
    async fn change_reason(&self, request: &GenerationRequest, output: &GeneratedPrediction) -> Option<String> {
        let previous = request.previous.as_deref()?.trim();
        let current = output.statement.as_deref()?.trim();
        if current.is_empty() || current == previous {
            return None;
        }

        let question = ChangeReasonRequest {
            domain: request.domain,
            horizon: request.horizon,
            previous: previous.to_string(),
            current: current.to_string(),
            headlines: request.headlines.clone(),
        };
        let reason = match self.judge.judge(&question).await {
            Ok(ChangeReason { reason }) if !reason.trim().is_empty() => reason.trim().to_string(),
            Ok(_) => FALLBACK_CHANGE_REASON.to_string(),
            Err(e) => {
                debug!(
                    domain = request.domain.id(),
                    horizon = request.horizon.id(),
                    error = %e,
                    "no change reason, using fallback"
                );
                FALLBACK_CHANGE_REASON.to_string()
            }
        };
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::*;
    use chrono::{TimeZone, Utc};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn article(id: &str, title: &str) -> Article {
        Article::new(
            id,
            title,
            "",
            "TechCrunch",
            Utc.with_ymd_and_hms(2026, 2, 2, 9, 0, 0).unwrap(),
            format!("https://example.com/{}", id),
        )
    }

    fn tracker(judge: Judge) -> PredictionTracker {
        PredictionTracker::new(PredictionSettings::default(), Arc::new(judge))
    }

    #[test]
    fn test_horizon_due_dates() {
        let d = date("2026-01-01");
        assert_eq!(Horizon::Week.advance(d), date("2026-01-08"));
        assert_eq!(Horizon::Month.advance(d), date("2026-02-01"));
        assert_eq!(Horizon::HalfYear.advance(d), date("2026-07-01"));
        assert_eq!(Horizon::Year.advance(d), date("2027-01-01"));
        assert_eq!(Horizon::Month.advance(date("2026-01-31")), date("2026-02-28"));
    }

    #[test]
    fn test_new_prediction_is_pending_with_slot_id() {
        let p = Prediction::new(Category::Semiconductor, Horizon::Month, date("2026-01-01"), "x");
        assert_eq!(p.prediction_id, "semiconductor-1m-2026-01-01");
        assert_eq!(p.status(), PredictionStatus::Pending);
        assert_eq!(p.due_at, date("2026-02-01"));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut p = Prediction::new(Category::Ai, Horizon::Week, date("2026-01-01"), "x");
        assert!(p.resolve(Resolution {
            verdict: Verdict::Confirmed,
            resolved_on: date("2026-01-08"),
            evidence_article_ids: vec![],
            rationale: String::new(),
        })
        .is_err());

        p.mark_due().unwrap();
        p.resolve(Resolution {
            verdict: Verdict::Refuted,
            resolved_on: date("2026-01-08"),
            evidence_article_ids: vec![],
            rationale: String::new(),
        })
        .unwrap();

        let err = p.mark_due().unwrap_err();
        assert_eq!(err.from, PredictionStatus::Resolved);
        assert_eq!(err.attempted, Transition::MarkDue);
        assert!(p.expire(date("2026-03-01")).is_err());
        assert_eq!(p.status(), PredictionStatus::Resolved);
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&PredictionStatus::ExpiredUnresolved).unwrap();
        assert_eq!(json, "\"expired-unresolved\"");
    }

    #[test]
    fn test_week_prediction_due_only_from_day_seven() {
        let tracker = tracker(offline_judge());
        let mut ledger = PredictionLedger::new();
        tracker
            .add(&mut ledger, Prediction::new(Category::Ai, Horizon::Week, date("2026-03-01"), "x"))
            .unwrap();

        assert!(tracker.advance(&mut ledger, date("2026-03-07")).is_empty());
        assert_eq!(tracker.advance(&mut ledger, date("2026-03-08")).len(), 1);
        assert!(tracker.advance(&mut ledger, date("2026-03-09")).is_empty());
    }

    #[test]
    fn test_grace_window_defaults_to_horizon_length() {
        let tracker = tracker(offline_judge());
        let mut ledger = PredictionLedger::new();
        tracker
            .add(&mut ledger, Prediction::new(Category::Ai, Horizon::Week, date("2026-03-01"), "x"))
            .unwrap();
        tracker.advance(&mut ledger, date("2026-03-08"));

        assert!(tracker.expire(&mut ledger, date("2026-03-15")).is_empty());
        assert_eq!(tracker.expire(&mut ledger, date("2026-03-16")).len(), 1);
        let p = ledger.get("ai-1w-2026-03-01").unwrap();
        assert_eq!(p.status(), PredictionStatus::ExpiredUnresolved);
        assert_eq!(p.expired_on(), Some(date("2026-03-16")));
    }

    #[tokio::test]
    async fn test_strong_keyword_match_confirms_without_llm() {
        let tracker = tracker(offline_judge());
        let mut ledger = PredictionLedger::new();
        tracker
            .add(
                &mut ledger,
                Prediction::new(Category::Semiconductor, Horizon::Month, date("2026-01-01"), "AI chip shortage eases"),
            )
            .unwrap();
        let a = article("a1", "AI chip shortage eases as new fabs come online");
        let evidence = [Evidence {
            article: &a,
            category: Some(Category::Semiconductor),
        }];

        let report = tracker.run(&mut ledger, date("2026-02-02"), &evidence).await;
        assert_eq!(report.became_due, vec!["semiconductor-1m-2026-01-01"]);
        assert_eq!(report.resolved, vec!["semiconductor-1m-2026-01-01"]);
        let p = ledger.get("semiconductor-1m-2026-01-01").unwrap();
        assert_eq!(p.resolution().unwrap().verdict, Verdict::Confirmed);
        assert_eq!(p.resolution().unwrap().evidence_article_ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_ambiguous_match_uses_llm_and_failure_stays_due() {
        let mut ledger = PredictionLedger::new();
        let offline = tracker(offline_judge());
        offline
            .add(
                &mut ledger,
                Prediction::new(Category::Semiconductor, Horizon::Month, date("2026-01-01"), "AI chip shortage eases"),
            )
            .unwrap();
        let a = article("a1", "AI chip shortage not easing, says analyst");
        let evidence = [Evidence {
            article: &a,
            category: Some(Category::Semiconductor),
        }];

        offline.run(&mut ledger, date("2026-02-02"), &evidence).await;
        let p = ledger.get("semiconductor-1m-2026-01-01").unwrap();
        assert_eq!(p.status(), PredictionStatus::Due);

        let backend = ScriptedBackend::always(
            r#"{"verdict": "refuted", "evidence_article_ids": ["a1", "bogus"], "rationale": "still tight"}"#,
        );
        let online = tracker(judge_with(backend.clone()));
        let resolved = online.reconcile(&mut ledger, date("2026-02-03"), &evidence).await;
        assert_eq!(resolved.len(), 1);
        let p = ledger.get("semiconductor-1m-2026-01-01").unwrap();
        let resolution = p.resolution().unwrap();
        assert_eq!(resolution.verdict, Verdict::Refuted);
        assert_eq!(resolution.evidence_article_ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_generation_fills_open_slots_and_records_supersession() {
        let backend = ScriptedBackend::always(r#"{"statement": "HBM 价格继续上涨", "subdomain": "memory"}"#);
        let mut settings = PredictionSettings::default();
        settings.horizons = vec![Horizon::Week];
        let tracker = PredictionTracker::new(settings, Arc::new(judge_with(backend)));
        let mut ledger = PredictionLedger::new();

        let a = article("a1", "SK hynix raises HBM prices");
        let evidence = [Evidence {
            article: &a,
            category: Some(Category::Semiconductor),
        }];

        let first = tracker.generate(&mut ledger, date("2026-03-01"), &evidence).await;
        assert_eq!(first, vec!["semiconductor-1w-2026-03-01"]);

        // Slot is occupied while the first prediction is pending.
        assert!(tracker.generate(&mut ledger, date("2026-03-02"), &evidence).await.is_empty());

        tracker.advance(&mut ledger, date("2026-03-08"));
        let second = tracker.generate(&mut ledger, date("2026-03-08"), &evidence).await;
        assert_eq!(second, vec!["semiconductor-1w-2026-03-08"]);
        let p = ledger.get("semiconductor-1w-2026-03-08").unwrap();
        assert_eq!(p.supersedes.as_deref(), Some("semiconductor-1w-2026-03-01"));
        assert_eq!(p.subdomain.as_deref(), Some("memory"));
    }

    async fn revise_week_slot(backend: Arc<ScriptedBackend>) -> PredictionLedger {
        let mut settings = PredictionSettings::default();
        settings.horizons = vec![Horizon::Week];
        let tracker = PredictionTracker::new(settings, Arc::new(judge_with(backend)));
        let mut ledger = PredictionLedger::new();
        let a = article("a1", "SK hynix raises HBM prices");
        let evidence = [Evidence {
            article: &a,
            category: Some(Category::Semiconductor),
        }];

        tracker.generate(&mut ledger, date("2026-03-01"), &evidence).await;
        tracker.advance(&mut ledger, date("2026-03-08"));
        tracker.generate(&mut ledger, date("2026-03-08"), &evidence).await;
        ledger
    }

    #[tokio::test]
    async fn test_revised_prediction_records_change_reason() {
        let backend = ScriptedBackend::new(vec![
            Ok(r#"{"statement": "HBM 价格继续上涨"}"#),
            Ok(r#"{"statement": "HBM 价格趋于平稳"}"#),
            Ok(r#"{"reason": "新增产能陆续投产"}"#),
        ]);
        let ledger = revise_week_slot(backend.clone()).await;

        let first = ledger.get("semiconductor-1w-2026-03-01").unwrap();
        assert_eq!(first.change_reason, None);
        let revised = ledger.get("semiconductor-1w-2026-03-08").unwrap();
        assert_eq!(revised.supersedes.as_deref(), Some("semiconductor-1w-2026-03-01"));
        assert_eq!(revised.change_reason.as_deref(), Some("新增产能陆续投产"));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_change_reason_falls_back_when_llm_fails() {
        let backend = ScriptedBackend::new(vec![
            Ok(r#"{"statement": "HBM 价格继续上涨"}"#),
            Ok(r#"{"statement": "HBM 价格趋于平稳"}"#),
            Err("overloaded"),
        ]);
        let ledger = revise_week_slot(backend).await;

        let revised = ledger.get("semiconductor-1w-2026-03-08").unwrap();
        assert_eq!(revised.statement_text, "HBM 价格趋于平稳");
        assert_eq!(revised.change_reason.as_deref(), Some(FALLBACK_CHANGE_REASON));
    }

    #[tokio::test]
    async fn test_unchanged_statement_has_no_change_reason() {
        let backend = ScriptedBackend::always(r#"{"statement": "HBM 价格继续上涨"}"#);
        let ledger = revise_week_slot(backend.clone()).await;

        let revised = ledger.get("semiconductor-1w-2026-03-08").unwrap();
        assert_eq!(revised.supersedes.as_deref(), Some("semiconductor-1w-2026-03-01"));
        assert_eq!(revised.change_reason, None);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_month_prediction_across_runs() {
        let backend = ScriptedBackend::always(r#"{"statement": "HBM prices keep rising"}"#);
        let mut settings = PredictionSettings::default();
        settings.horizons = vec![Horizon::Month];
        let tracker = PredictionTracker::new(settings, Arc::new(judge_with(backend)));
        let mut ledger = PredictionLedger::new();
        let id = "semiconductor-1m-2026-01-01";

        let today = article("a0", "SK hynix raises HBM prices");
        let report = tracker
            .run(
                &mut ledger,
                date("2026-01-01"),
                &[Evidence {
                    article: &today,
                    category: Some(Category::Semiconductor),
                }],
            )
            .await;
        assert_eq!(report.created, vec![id]);
        assert_eq!(ledger.get(id).unwrap().due_at, date("2026-02-01"));

        let report = tracker.run(&mut ledger, date("2026-01-15"), &[]).await;
        assert!(report.became_due.is_empty());
        assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Pending);

        let later = article("a1", "HBM prices keep rising as demand surges");
        let report = tracker
            .run(
                &mut ledger,
                date("2026-02-02"),
                &[Evidence {
                    article: &later,
                    category: Some(Category::Semiconductor),
                }],
            )
            .await;
        assert_eq!(report.became_due, vec![id]);
        assert_eq!(report.resolved, vec![id]);
        assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Resolved);
        assert_eq!(report.created, vec!["semiconductor-1m-2026-02-02"]);

        // Resolved predictions are left alone by later runs.
        let report = tracker.run(&mut ledger, date("2026-04-01"), &[]).await;
        assert!(!report.expired.contains(&id.to_string()));
        assert_eq!(ledger.get(id).unwrap().status(), PredictionStatus::Resolved);
        assert_eq!(ledger.updated_at(), Some(date("2026-04-01")));
    }

    #[tokio::test]
    async fn test_generation_offline_creates_nothing() {
        let tracker = tracker(offline_judge());
        let mut ledger = PredictionLedger::new();
        let a = article("a1", "SK hynix raises HBM prices");
        let evidence = [Evidence {
            article: &a,
            category: Some(Category::Semiconductor),
        }];
        assert!(tracker.generate(&mut ledger, date("2026-03-01"), &evidence).await.is_empty());
        assert!(ledger.is_empty());
    }
}
