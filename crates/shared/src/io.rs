use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::briefing::{Briefing, BRIEFING_VERSION};
use crate::config::APP_DIR;

/// `<local data dir>/daily-briefing`, created on first use.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Could not determine local data directory")?
        .join(APP_DIR);

    fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    Ok(data_dir)
}

pub fn get_default_briefings_dir() -> Result<PathBuf> {
    let dir = get_data_dir()?.join("briefings");
    fs::create_dir_all(&dir).context("Failed to create briefings directory")?;
    Ok(dir)
}

pub fn default_ledger_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("predictions.json"))
}

pub fn default_cache_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("judgments.sqlite3"))
}

pub fn briefing_filename(run_date: NaiveDate) -> String {
    format!("briefing-{}.json", run_date.format("%Y-%m-%d"))
}

/// Write `content` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("Failed to create temporary file")?;
    tmp.write_all(content).context("Failed to write temporary file")?;
    tmp.as_file().sync_all().context("Failed to flush temporary file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Save a briefing as JSON into `dir`, replacing any earlier file for the same day.
pub fn save_briefing(briefing: &Briefing, dir: &Path) -> Result<PathBuf> {
    let filepath = dir.join(briefing_filename(briefing.run_date));

    let json = serde_json::to_string_pretty(briefing).context("Failed to serialize briefing")?;

    write_atomic(&filepath, json.as_bytes())?;

    Ok(filepath)
}

pub fn load_briefing(filepath: &Path) -> Result<Briefing> {
    if !filepath.exists() {
        anyhow::bail!("Briefing file not found: {}", filepath.display());
    }

    let content = fs::read_to_string(filepath)
        .with_context(|| format!("Failed to read briefing file: {}", filepath.display()))?;

    let briefing: Briefing = serde_json::from_str(&content).with_context(|| {
        format!(
            "Failed to parse briefing JSON from {}. The file may be corrupted or not a briefing file.",
            filepath.display()
        )
    })?;

    if briefing.version != BRIEFING_VERSION {
        anyhow::bail!(
            "Unsupported briefing file version: {}. Expected {}. Please rerun daily-briefing for {}.",
            briefing.version,
            BRIEFING_VERSION,
            briefing.run_date
        );
    }

    Ok(briefing)
}

/// Every readable briefing in `dir`, newest run date first.
pub fn list_briefings(dir: &Path) -> Result<Vec<(PathBuf, Briefing)>> {
    let mut files = Vec::new();

    if dir.exists() {
        for entry in fs::read_dir(dir).context("Failed to read briefings directory")? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                match load_briefing(&path) {
                    Ok(briefing) => files.push((path, briefing)),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable briefing"),
                }
            }
        }
    }

    files.sort_by(|a, b| {
        b.1.run_date
            .cmp(&a.1.run_date)
            .then_with(|| b.1.generated_at.cmp(&a.1.generated_at))
    });

    Ok(files)
}
