use crate::config::Config;
use crate::master::parquet::{self, MasterSummary};
use crate::master::variants::{self, MasterVariant, VariantCandidate};
use crate::types::{Tag, UnitSpec};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FreshnessStatus {
    Fresh,
    Old,
    Stale,
    Missing,
    Error,
}

impl FreshnessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::Old => "OLD",
            Self::Stale => "STALE",
            Self::Missing => "MISSING",
            Self::Error => "ERROR",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Fresh => 0,
            Self::Old => 1,
            Self::Stale | Self::Missing | Self::Error => 2,
        }
    }

    pub fn needs_refresh(self) -> bool {
        self != Self::Fresh
    }
}

impl std::fmt::Display for FreshnessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    pub fresh_max: Duration,
    pub stale_after: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            fresh_max: Duration::hours(6),
            stale_after: Duration::hours(24),
        }
    }
}

impl FreshnessThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fresh_max: config.fresh_max(),
            stale_after: config.stale_after(),
        }
    }

    /// `age < fresh_max` is FRESH, `age < stale_after` is OLD, otherwise STALE.
    pub fn classify_age(&self, age: Duration) -> FreshnessStatus {
        if age < self.fresh_max {
            FreshnessStatus::Fresh
        } else if age < self.stale_after {
            FreshnessStatus::Old
        } else {
            FreshnessStatus::Stale
        }
    }
}

fn serialize_age_hours<S: Serializer>(
    age: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => serializer.serialize_some(&(age.num_seconds() as f64 / 3600.0)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessRecord {
    pub unit: String,
    /// `None` for the unit-level record.
    pub tag: Option<String>,
    pub latest_time: Option<NaiveDateTime>,
    #[serde(rename = "age_hours", serialize_with = "serialize_age_hours")]
    pub age: Option<Duration>,
    pub status: FreshnessStatus,
    pub artifact: Option<PathBuf>,
    pub variant: Option<MasterVariant>,
    pub from_file_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FreshnessRecord {
    fn missing(unit: &str, tag: Option<&str>) -> Self {
        Self {
            unit: unit.to_string(),
            tag: tag.map(str::to_string),
            latest_time: None,
            age: None,
            status: FreshnessStatus::Missing,
            artifact: None,
            variant: None,
            from_file_metadata: false,
            detail: None,
        }
    }
}

/// What was found on disk for one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterSnapshot {
    Absent,
    Readable {
        candidate: VariantCandidate,
        summary: MasterSummary,
    },
    Unreadable {
        candidate: VariantCandidate,
        /// File modification time in plant-local time.
        modified: NaiveDateTime,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFreshness {
    pub plant: String,
    #[serde(flatten)]
    pub record: FreshnessRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<FreshnessRecord>,
}

impl UnitFreshness {
    pub fn status(&self) -> FreshnessStatus {
        self.record.status
    }
}

/// Pure classification of a snapshot. `catalog` adds per-tag records; catalog tags
/// absent from the master are MISSING.
pub fn classify(
    unit: &UnitSpec,
    snapshot: &MasterSnapshot,
    now: NaiveDateTime,
    thresholds: &FreshnessThresholds,
    catalog: Option<&[Tag]>,
) -> UnitFreshness {
    let name = unit.unit.as_str();
    let (record, tags) = match snapshot {
        MasterSnapshot::Absent => {
            let tags = catalog
                .unwrap_or_default()
                .iter()
                .map(|tag| FreshnessRecord::missing(name, Some(tag.as_str())))
                .collect();
            (FreshnessRecord::missing(name, None), tags)
        }
        MasterSnapshot::Unreadable {
            candidate,
            modified,
            detail,
        } => {
            let age = now - *modified;
            let error = |tag: Option<&str>| FreshnessRecord {
                unit: name.to_string(),
                tag: tag.map(str::to_string),
                latest_time: Some(*modified),
                age: Some(age),
                status: FreshnessStatus::Error,
                artifact: Some(candidate.path.clone()),
                variant: Some(candidate.variant),
                from_file_metadata: true,
                detail: Some(detail.clone()),
            };
            let tags = catalog
                .unwrap_or_default()
                .iter()
                .map(|tag| error(Some(tag.as_str())))
                .collect();
            (error(None), tags)
        }
        MasterSnapshot::Readable { candidate, summary } => {
            let record_for = |tag: Option<&str>, latest: Option<NaiveDateTime>| match latest {
                Some(latest) => {
                    let age = now - latest;
                    FreshnessRecord {
                        unit: name.to_string(),
                        tag: tag.map(str::to_string),
                        latest_time: Some(latest),
                        age: Some(age),
                        status: thresholds.classify_age(age),
                        artifact: Some(candidate.path.clone()),
                        variant: Some(candidate.variant),
                        from_file_metadata: false,
                        detail: None,
                    }
                }
                None => FreshnessRecord {
                    artifact: Some(candidate.path.clone()),
                    variant: Some(candidate.variant),
                    ..FreshnessRecord::missing(name, tag)
                },
            };
            let tags = match catalog {
                Some(catalog) => catalog
                    .iter()
                    .map(|tag| {
                        record_for(
                            Some(tag.as_str()),
                            summary.latest_per_tag.get(tag.as_str()).copied(),
                        )
                    })
                    .collect(),
                None => summary
                    .latest_per_tag
                    .iter()
                    .map(|(tag, latest)| record_for(Some(tag), Some(*latest)))
                    .collect(),
            };
            (record_for(None, summary.latest), tags)
        }
    };
    UnitFreshness {
        plant: unit.plant.clone(),
        record,
        tags,
    }
}

/// Reads the most authoritative master variant of a unit. Blocking.
pub fn inspect(data_dir: &Path, unit: &UnitSpec, offset: FixedOffset) -> Result<MasterSnapshot> {
    let Some(candidate) = variants::locate_master(data_dir, &unit.slug())
        .with_context(|| format!("failed to list masters for {}", unit.unit))?
    else {
        return Ok(MasterSnapshot::Absent);
    };
    match parquet::summarize(&candidate.path) {
        Ok(summary) => Ok(MasterSnapshot::Readable { candidate, summary }),
        Err(err) => {
            let modified = DateTime::<Utc>::from(candidate.modified)
                .with_timezone(&offset)
                .naive_local();
            tracing::warn!(
                unit = %unit.unit,
                path = %candidate.path.display(),
                error = %err,
                "master unreadable; falling back to file metadata"
            );
            Ok(MasterSnapshot::Unreadable {
                candidate,
                modified,
                detail: err.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FreshnessReport {
    pub generated_at: NaiveDateTime,
    pub fresh_max_hours: f64,
    pub stale_after_hours: f64,
    pub overall: FreshnessStatus,
    pub units: Vec<UnitFreshness>,
}

impl FreshnessReport {
    pub fn new(
        generated_at: NaiveDateTime,
        thresholds: &FreshnessThresholds,
        units: Vec<UnitFreshness>,
    ) -> Self {
        let overall = units
            .iter()
            .map(UnitFreshness::status)
            .max()
            .unwrap_or(FreshnessStatus::Missing);
        Self {
            generated_at,
            fresh_max_hours: thresholds.fresh_max.num_seconds() as f64 / 3600.0,
            stale_after_hours: thresholds.stale_after.num_seconds() as f64 / 3600.0,
            overall,
            units,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.overall.exit_code()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create report dir")?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?).context("write report tmp")?;
        fs::rename(&tmp, path).context("rename report")?;
        Ok(())
    }
}

/// Classifies units against the masters under `data_dir`.
#[derive(Debug, Clone)]
pub struct FreshnessClassifier {
    data_dir: PathBuf,
    thresholds: FreshnessThresholds,
    offset: FixedOffset,
}

impl FreshnessClassifier {
    pub fn new(data_dir: PathBuf, thresholds: FreshnessThresholds, offset: FixedOffset) -> Self {
        Self {
            data_dir,
            thresholds,
            offset,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            FreshnessThresholds::from_config(config),
            config.plant_offset(),
        )
    }

    pub fn thresholds(&self) -> &FreshnessThresholds {
        &self.thresholds
    }

    /// Wall-clock now in plant-local time.
    pub fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }

    pub async fn check_unit(
        &self,
        unit: &UnitSpec,
        now: NaiveDateTime,
        catalog: Option<Vec<Tag>>,
    ) -> UnitFreshness {
        let data_dir = self.data_dir.clone();
        let offset = self.offset;
        let spec = unit.clone();
        let snapshot = tokio::task::spawn_blocking(move || inspect(&data_dir, &spec, offset)).await;
        let snapshot = match snapshot {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => return self.error_record(unit, format!("{err:#}")),
            Err(err) => return self.error_record(unit, err.to_string()),
        };
        classify(unit, &snapshot, now, &self.thresholds, catalog.as_deref())
    }

    fn error_record(&self, unit: &UnitSpec, detail: String) -> UnitFreshness {
        UnitFreshness {
            plant: unit.plant.clone(),
            record: FreshnessRecord {
                status: FreshnessStatus::Error,
                detail: Some(detail),
                ..FreshnessRecord::missing(&unit.unit, None)
            },
            tags: Vec::new(),
        }
    }
}
