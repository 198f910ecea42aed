use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::briefing::{ArticleRef, Briefing, BriefingItem, PredictionEntry, Section};
use crate::people::KeyPersonMention;

pub struct MarkdownRenderer;

impl MarkdownRenderer {
    fn escape_markdown(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if matches!(c, '\\' | '*' | '_' | '[' | ']' | '`' | '<' | '>' | '#') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    fn link(article: &ArticleRef) -> String {
        format!(
            "[{}]({})",
            Self::escape_markdown(&article.title),
            article.url.replace(' ', "%20").replace(')', "%29")
        )
    }

    fn render_item(out: &mut String, index: usize, item: &BriefingItem) {
        let rep = &item.representative;
        out.push_str(&format!("### {}. {}\n\n", index + 1, Self::link(rep)));
        if let Some(original) = &rep.original_title {
            out.push_str(&format!("*{}*\n\n", Self::escape_markdown(original)));
        }
        out.push_str(&format!(
            "来源：{} · {}\n\n",
            Self::escape_markdown(&rep.source_name),
            rep.published_at.format("%Y-%m-%d %H:%M UTC")
        ));
        if !rep.excerpt.is_empty() {
            out.push_str(&format!("> {}\n\n", Self::escape_markdown(&rep.excerpt)));
        }

        if !item.followups.is_empty() {
            out.push_str("后续报道：\n\n");
            for followup in &item.followups {
                let detail = match followup.outcome {
                    outcome if outcome.is_retained() && !followup.detail.is_empty() => {
                        format!("{}：{}", followup.outcome.label(), Self::escape_markdown(&followup.detail))
                    }
                    _ => followup.outcome.label().to_string(),
                };
                out.push_str(&format!(
                    "- {}（{}，{}）\n",
                    Self::link(&followup.article),
                    Self::escape_markdown(&followup.article.source_name),
                    detail
                ));
            }
            out.push('\n');
        }
        if item.dropped_followups > 0 {
            out.push_str(&format!("*另有 {} 篇相同报道已合并*\n\n", item.dropped_followups));
        }
    }

    fn render_mentions(out: &mut String, mentions: &[KeyPersonMention], briefing: &Briefing) {
        for mention in mentions {
            let source = briefing
                .article(&mention.article_id)
                .map(|a| format!(" —— [{}]({})", Self::escape_markdown(&a.source_name), a.url))
                .unwrap_or_default();
            out.push_str(&format!(
                "- **{}**：「{}」{}\n",
                Self::escape_markdown(&mention.person_name),
                Self::escape_markdown(&mention.quote_text),
                source
            ));
        }
        out.push('\n');
    }

    fn render_section(out: &mut String, section: &Section, briefing: &Briefing) {
        out.push_str(&format!("## {}\n\n", section.heading()));
        for (i, item) in section.items.iter().enumerate() {
            Self::render_item(out, i, item);
        }
        if !section.mentions.is_empty() {
            out.push_str("**关键人物发言**\n\n");
            Self::render_mentions(out, &section.mentions, briefing);
        }
    }

    fn render_prediction(out: &mut String, entry: &PredictionEntry) {
        let subdomain = entry
            .subdomain
            .as_deref()
            .map(|s| format!(" · {}", Self::escape_markdown(s)))
            .unwrap_or_default();
        out.push_str(&format!(
            "- [{}{} · {}] {}（{} 预测，{} 到期）\n",
            entry.domain.display_name(),
            subdomain,
            entry.horizon.label(),
            Self::escape_markdown(&entry.statement),
            entry.created_at,
            entry.due_at
        ));
        if let Some(verdict) = entry.verdict {
            out.push_str(&format!("  - {}", verdict.label()));
            if let Some(rationale) = entry.rationale.as_deref().filter(|r| !r.is_empty()) {
                out.push_str(&format!("：{}", Self::escape_markdown(rationale)));
            }
            out.push('\n');
        }
        if let Some(previous) = &entry.previous_statement {
            out.push_str(&format!("  - 此前预测：{}\n", Self::escape_markdown(previous)));
        }
        if let Some(reason) = entry.change_reason.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!("  - 调整原因：{}\n", Self::escape_markdown(reason)));
        }
    }

    fn render_predictions(out: &mut String, briefing: &Briefing) {
        let digest = &briefing.predictions;
        if digest.is_empty() {
            return;
        }
        out.push_str("## 🔮 预测追踪\n\n");
        let groups: [(&str, &[PredictionEntry]); 5] = [
            ("已验证", digest.resolved.as_slice()),
            ("到期待验证", digest.due.as_slice()),
            ("已过期未验证", digest.expired.as_slice()),
            ("预测修订", digest.revised.as_slice()),
            ("新增预测", digest.new.as_slice()),
        ];
        for (heading, entries) in groups {
            if entries.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n\n", heading));
            for entry in entries {
                Self::render_prediction(out, entry);
            }
            out.push('\n');
        }
    }

    fn render_overview(out: &mut String, briefing: &Briefing) {
        let s = &briefing.stats;
        out.push_str("## 📋 今日概览\n\n");
        out.push_str(&format!(
            "- 采集 {} 条，过滤 {} 条，入库 {} 篇\n",
            s.collected_payloads, s.dropped_payloads, s.articles
        ));
        out.push_str(&format!(
            "- 事件 {} 个，保留报道 {} 篇，合并重复 {} 篇\n",
            s.clusters, s.retained_articles, s.dropped_followups
        ));
        if s.mentions > 0 {
            out.push_str(&format!("- 关键人物发言 {} 条\n", s.mentions));
        }
        if !s.failed_sources.is_empty() {
            out.push_str(&format!(
                "- 未能采集：{}\n",
                Self::escape_markdown(&s.failed_sources.join("、"))
            ));
        }
        out.push('\n');

        if !briefing.headlines.is_empty() {
            out.push_str("**今日头条**\n\n");
            for headline in &briefing.headlines {
                out.push_str(&format!(
                    "- {} {}：[{}]({})\n",
                    headline.category.icon(),
                    headline.category.display_name(),
                    Self::escape_markdown(&headline.title),
                    headline.url
                ));
            }
            out.push('\n');
        }
    }

    pub fn render(briefing: &Briefing) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# {} · {}\n\n",
            Self::escape_markdown(&briefing.title),
            briefing.run_date.format("%Y-%m-%d")
        ));
        out.push_str(&format!(
            "*生成时间：{}*\n\n",
            briefing.generated_at.format("%Y-%m-%d %H:%M UTC")
        ));

        Self::render_overview(&mut out, briefing);
        for section in &briefing.sections {
            Self::render_section(&mut out, section, briefing);
        }
        if !briefing.key_people.is_empty() {
            out.push_str("## 🎤 关键人物发言\n\n");
            Self::render_mentions(&mut out, &briefing.key_people, briefing);
        }
        Self::render_predictions(&mut out, briefing);
        out
    }

    pub fn filename(briefing: &Briefing) -> String {
        format!("briefing-{}.md", briefing.run_date.format("%Y-%m-%d"))
    }
}

/// Write the rendered Markdown into `dir`, creating it if needed.
pub fn save_markdown(content: &str, dir: &Path, filename: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let filepath = dir.join(filename);
    fs::write(&filepath, content).context("Failed to write briefing Markdown")?;
    Ok(filepath)
}
