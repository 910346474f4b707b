pub mod lock;
pub mod merge;
pub mod parquet;
pub mod variants;

use crate::config::Config;
use crate::error::{CorruptMasterError, EmptyMergeWarning, MergeError, SchemaError};
use crate::types::{Sample, UnitSpec};
use chrono::Utc;
use lock::MasterLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use variants::{MasterVariant, VariantCandidate};

pub use merge::merge_samples;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub unit: String,
    pub path: PathBuf,
    pub previous_rows: usize,
    pub new_samples: usize,
    pub total_rows: usize,
    pub folded: Vec<MasterVariant>,
    pub backups: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Committed(MergeReport),
    Skipped(EmptyMergeWarning),
}

/// Sole writer of unit masters. Commits for the same unit are serialized in
/// process and guarded by an advisory file lock across processes.
#[derive(Debug, Clone)]
pub struct MasterStore {
    data_dir: PathBuf,
    backups_dir: PathBuf,
    backup_keep: usize,
    unit_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MasterStore {
    pub fn new(data_dir: PathBuf, backups_dir: PathBuf, backup_keep: usize) -> Self {
        Self {
            data_dir,
            backups_dir,
            backup_keep,
            unit_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.data_dir.clone(), config.backups_dir(), config.backup_keep)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn master_path(&self, unit: &UnitSpec) -> PathBuf {
        MasterVariant::Dedup.path(&self.data_dir, &unit.slug())
    }

    pub fn locate(&self, unit: &UnitSpec) -> io::Result<Option<VariantCandidate>> {
        variants::locate_master(&self.data_dir, &unit.slug())
    }

    fn unit_guard(&self, unit: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .unit_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(unit.to_string()).or_default().clone()
    }

    /// Folds `samples` into the unit's master. Empty input is a no-op.
    pub async fn commit(
        &self,
        unit: &UnitSpec,
        samples: Vec<Sample>,
    ) -> Result<MergeOutcome, MergeError> {
        if samples.is_empty() {
            let warning = EmptyMergeWarning {
                unit: unit.unit.clone(),
            };
            tracing::warn!(unit = %unit.unit, "{warning}");
            return Ok(MergeOutcome::Skipped(warning));
        }
        validate_samples(unit, &samples, "new samples")?;

        let guard = self.unit_guard(&unit.unit);
        let _held = guard.lock().await;
        let store = self.clone();
        let unit = unit.clone();
        let report = tokio::task::spawn_blocking(move || store.commit_blocking(&unit, samples))
            .await
            .map_err(|err| MergeError::Task(err.to_string()))??;
        tracing::info!(
            unit = %report.unit,
            path = %report.path.display(),
            previous_rows = report.previous_rows,
            new_samples = report.new_samples,
            total_rows = report.total_rows,
            "master committed"
        );
        Ok(MergeOutcome::Committed(report))
    }

    /// Merges a long-format parquet produced elsewhere. The source is removed
    /// after a successful commit unless `keep_source` is set.
    pub async fn merge_external(
        &self,
        unit: &UnitSpec,
        source: &Path,
        keep_source: bool,
    ) -> Result<MergeOutcome, MergeError> {
        let path = source.to_path_buf();
        let samples = tokio::task::spawn_blocking(move || parquet::read_samples(&path))
            .await
            .map_err(|err| MergeError::Task(err.to_string()))??;
        let source_name = source.display().to_string();
        validate_samples(unit, &samples, &source_name)?;

        let outcome = self.commit(unit, samples).await?;
        if matches!(outcome, MergeOutcome::Committed(_)) && !keep_source {
            match fs::remove_file(source) {
                Ok(()) => tracing::info!(source = %source.display(), "removed merged source"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(outcome)
    }

    /// Backs up and removes every master variant of the unit. Returns the backups.
    pub async fn drop_master(&self, unit: &UnitSpec) -> Result<Vec<PathBuf>, MergeError> {
        let guard = self.unit_guard(&unit.unit);
        let _held = guard.lock().await;
        let store = self.clone();
        let unit = unit.clone();
        tokio::task::spawn_blocking(move || store.drop_blocking(&unit))
            .await
            .map_err(|err| MergeError::Task(err.to_string()))?
    }

    fn commit_blocking(
        &self,
        unit: &UnitSpec,
        samples: Vec<Sample>,
    ) -> Result<MergeReport, MergeError> {
        fs::create_dir_all(&self.data_dir)?;
        let slug = unit.slug();
        let _lock = self.lock_unit(unit)?;

        let candidates = variants::discover(&self.data_dir, &slug)?;
        let mut existing: Vec<Sample> = Vec::new();
        // Least authoritative first so the preferred variant wins on shared keys.
        for candidate in candidates.iter().rev() {
            let rows = parquet::read_samples(&candidate.path).map_err(|err| CorruptMasterError {
                path: candidate.path.clone(),
                detail: err.to_string(),
            })?;
            existing = merge_samples(existing, rows);
        }
        let previous_rows = existing.len();
        let new_samples = samples.len();
        let merged = merge_samples(existing, samples);

        let stamp = backup_stamp();
        let mut backups = Vec::new();
        if candidates.is_empty() {
            let baseline = self.backup_path(&slug, &stamp, "empty");
            parquet::write_samples(&baseline, &[])?;
            backups.push(baseline);
        } else {
            for candidate in &candidates {
                backups.push(self.backup_file(&slug, &stamp, candidate)?);
            }
        }

        let target = MasterVariant::Dedup.path(&self.data_dir, &slug);
        parquet::write_samples(&target, &merged)?;

        let mut folded = Vec::new();
        for candidate in &candidates {
            folded.push(candidate.variant);
            if candidate.path != target {
                remove_if_present(&candidate.path)?;
            }
        }
        self.prune_backups(&slug)?;

        Ok(MergeReport {
            unit: unit.unit.clone(),
            path: target,
            previous_rows,
            new_samples,
            total_rows: merged.len(),
            folded,
            backups,
        })
    }

    fn drop_blocking(&self, unit: &UnitSpec) -> Result<Vec<PathBuf>, MergeError> {
        fs::create_dir_all(&self.data_dir)?;
        let slug = unit.slug();
        let _lock = self.lock_unit(unit)?;
        let stamp = backup_stamp();
        let mut backups = Vec::new();
        for candidate in variants::discover(&self.data_dir, &slug)? {
            backups.push(self.backup_file(&slug, &stamp, &candidate)?);
            remove_if_present(&candidate.path)?;
        }
        self.prune_backups(&slug)?;
        tracing::warn!(unit = %unit.unit, backups = backups.len(), "dropped unit master");
        Ok(backups)
    }

    fn lock_unit(&self, unit: &UnitSpec) -> Result<MasterLock, MergeError> {
        let path = self.data_dir.join(format!("{}.lock", unit.slug()));
        let lock = MasterLock::try_acquire(&path, &unit.unit)?;
        tracing::debug!(unit = %unit.unit, lock = %lock.path().display(), "holding master lock");
        Ok(lock)
    }

    fn backup_path(&self, slug: &str, stamp: &str, label: &str) -> PathBuf {
        self.backups_dir.join(format!("{slug}.{stamp}.{label}.parquet"))
    }

    fn backup_file(
        &self,
        slug: &str,
        stamp: &str,
        candidate: &VariantCandidate,
    ) -> Result<PathBuf, MergeError> {
        fs::create_dir_all(&self.backups_dir)?;
        let dest = self.backup_path(slug, stamp, candidate.variant.as_str());
        fs::copy(&candidate.path, &dest)?;
        Ok(dest)
    }

    /// Keeps the unit's backups from the newest `backup_keep` stamps. One
    /// stamp covers every file a single commit or drop copied aside.
    fn prune_backups(&self, slug: &str) -> Result<(), MergeError> {
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let prefix = format!("{slug}.");
        let backups: Vec<(String, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".parquet"))
            .filter_map(|name| {
                let stamp = name[prefix.len()..].split('.').next()?.to_string();
                is_backup_stamp(&stamp).then_some((stamp, name))
            })
            .collect();
        let stamps: BTreeSet<&str> = backups.iter().map(|(stamp, _)| stamp.as_str()).collect();
        let kept: BTreeSet<&str> = stamps.into_iter().rev().take(self.backup_keep.max(1)).collect();
        for (stamp, name) in &backups {
            if kept.contains(stamp.as_str()) {
                continue;
            }
            let path = self.backups_dir.join(name);
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to prune backup");
            }
        }
        Ok(())
    }
}

fn validate_samples(
    unit: &UnitSpec,
    samples: &[Sample],
    source_name: &str,
) -> Result<(), SchemaError> {
    let schema_error = |detail: String| SchemaError {
        source_name: source_name.to_string(),
        detail,
    };
    if let Some(bad) = samples.iter().find(|s| s.tag.trim().is_empty()) {
        return Err(schema_error(format!("sample at {} has no tag", bad.time)));
    }
    if let Some(bad) = samples.iter().find(|s| s.unit != unit.unit) {
        return Err(schema_error(format!(
            "sample for unit {:?} does not belong to {}",
            bad.unit, unit.unit
        )));
    }
    Ok(())
}

fn backup_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

fn is_backup_stamp(raw: &str) -> bool {
    raw.len() == 18
        && raw.as_bytes()[8] == b'T'
        && raw.chars().filter(|c| c.is_ascii_digit()).count() == 17
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
