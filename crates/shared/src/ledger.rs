//! The persisted prediction ledger and its single-writer lock.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::models::Category;
use crate::prediction::{Horizon, Prediction, PredictionStatus};

pub const LEDGER_VERSION: &str = "1.0";

/// Snapshot of every prediction ever made, keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLedger {
    version: String,
    #[serde(default)]
    updated_at: Option<NaiveDate>,
    #[serde(default)]
    predictions: BTreeMap<String, Prediction>,
}

impl Default for PredictionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionLedger {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION.to_string(),
            updated_at: None,
            predictions: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn updated_at(&self) -> Option<NaiveDate> {
        self.updated_at
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Prediction> {
        self.predictions.get(id)
    }

    /// Predictions in id order.
    pub fn predictions(&self) -> impl Iterator<Item = &Prediction> {
        self.predictions.values()
    }

    pub fn with_status(&self, status: PredictionStatus) -> impl Iterator<Item = &Prediction> {
        self.predictions().filter(move |p| p.status() == status)
    }

    pub fn has_pending(&self, domain: Category, horizon: Horizon) -> bool {
        self.predictions().any(|p| {
            p.domain == domain && p.horizon == horizon && p.status() == PredictionStatus::Pending
        })
    }

    /// Most recent prediction for a (domain, horizon) slot, whatever its status.
    pub fn latest_for(&self, domain: Category, horizon: Horizon) -> Option<&Prediction> {
        self.predictions()
            .filter(|p| p.domain == domain && p.horizon == horizon)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.prediction_id.cmp(&b.prediction_id))
            })
    }

    pub(crate) fn insert(&mut self, prediction: Prediction) -> Result<(), LedgerError> {
        if self.predictions.contains_key(&prediction.prediction_id) {
            return Err(LedgerError::Duplicate(prediction.prediction_id));
        }
        self.predictions
            .insert(prediction.prediction_id.clone(), prediction);
        Ok(())
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Prediction> {
        self.predictions.get_mut(id)
    }

    pub(crate) fn touch(&mut self, run_date: NaiveDate) {
        self.updated_at = Some(run_date);
    }
}

/// Held for the whole load-modify-persist cycle. Dropping it releases the lock.
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
}

impl LedgerLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "ledger lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove ledger lock"),
        }
    }
}

/// The ledger file on disk.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "predictions.json".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Take the exclusive lock or fail immediately if another run holds it.
    /// A lock left by a crashed run must be removed by hand; its contents name
    /// the process that created it.
    pub fn lock(&self) -> Result<LedgerLock, LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = self.lock_path();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(LedgerError::Locked {
                    path: lock_path,
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let lock = LedgerLock { path: lock_path };
        writeln!(
            file,
            "pid {} since {}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        debug!(path = %lock.path.display(), "ledger lock acquired");
        Ok(lock)
    }

    /// Read the ledger. A missing file is an empty ledger.
    pub fn load(&self, _lock: &LedgerLock) -> Result<PredictionLedger, LedgerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no prediction ledger yet, starting empty");
                return Ok(PredictionLedger::new());
            }
            Err(e) => return Err(e.into()),
        };

        let ledger: PredictionLedger =
            serde_json::from_str(&content).map_err(|source| LedgerError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if ledger.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                found: ledger.version,
                expected: LEDGER_VERSION.to_string(),
            });
        }

        debug!(path = %self.path.display(), predictions = ledger.len(), "ledger loaded");
        Ok(ledger)
    }

    /// Replace the ledger file atomically: write a sibling temp file, then
    /// rename it over the old one.
    pub fn save(&self, _lock: &LedgerLock, ledger: &PredictionLedger) -> Result<(), LedgerError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, ledger)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(path = %self.path.display(), predictions = ledger.len(), "ledger saved");
        Ok(())
    }
}
