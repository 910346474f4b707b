use crate::error::ConfigError;
use crate::types::{StepExpr, TimeExpr, TimeRange, UnitSpec};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, FixedOffset, Offset, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const UNITS_MANIFEST: &str = "units.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,

    pub pi_server: String,
    pub webapi_url: Option<String>,
    pub webapi_username: Option<String>,
    pub webapi_password: Option<String>,
    pub webapi_insecure_tls: bool,

    pub start: String,
    pub end: String,
    pub step: String,

    pub fetch_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub settle_cycles: u32,
    pub circuit_breaker_threshold: u32,
    pub retry_passes: u32,
    pub unit_workers: usize,

    pub fresh_max_hours: f64,
    pub stale_after_hours: f64,
    pub min_valid_year: i32,
    pub backup_keep: usize,
    pub utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/processed"),
            config_dir: PathBuf::from("config"),
            pi_server: String::new(),
            webapi_url: None,
            webapi_username: None,
            webapi_password: None,
            webapi_insecure_tls: false,
            start: "-1d".to_string(),
            end: "*".to_string(),
            step: "-0.1h".to_string(),
            fetch_timeout_secs: 45,
            poll_interval_ms: 500,
            settle_cycles: 3,
            circuit_breaker_threshold: 5,
            retry_passes: 0,
            unit_workers: 2,
            fresh_max_hours: 6.0,
            stale_after_hours: 24.0,
            min_valid_year: 2000,
            backup_keep: 5,
            utc_offset_minutes: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            data_dir: PathBuf::from(env_string(
                "HISTSYNC_DATA_DIR",
                defaults.data_dir.display().to_string(),
            )),
            config_dir: PathBuf::from(env_string(
                "HISTSYNC_CONFIG_DIR",
                defaults.config_dir.display().to_string(),
            )),
            pi_server: env_string("HISTSYNC_PI_SERVER", defaults.pi_server),
            webapi_url: env_optional("HISTSYNC_WEBAPI_URL"),
            webapi_username: env_optional("HISTSYNC_WEBAPI_USERNAME"),
            webapi_password: env_optional("HISTSYNC_WEBAPI_PASSWORD"),
            webapi_insecure_tls: env_bool("HISTSYNC_WEBAPI_INSECURE_TLS", false),
            start: env_string("HISTSYNC_START", defaults.start),
            end: env_string("HISTSYNC_END", defaults.end),
            step: env_string("HISTSYNC_STEP", defaults.step),
            fetch_timeout_secs: env_parse(
                "HISTSYNC_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout_secs,
            )?,
            poll_interval_ms: env_parse("HISTSYNC_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            settle_cycles: env_parse("HISTSYNC_SETTLE_CYCLES", defaults.settle_cycles)?,
            circuit_breaker_threshold: env_parse(
                "HISTSYNC_CIRCUIT_BREAKER",
                defaults.circuit_breaker_threshold,
            )?,
            retry_passes: env_parse("HISTSYNC_RETRY_PASSES", defaults.retry_passes)?,
            unit_workers: env_parse("HISTSYNC_UNIT_WORKERS", defaults.unit_workers)?,
            fresh_max_hours: env_parse("HISTSYNC_FRESH_MAX_HOURS", defaults.fresh_max_hours)?,
            stale_after_hours: env_parse("HISTSYNC_STALE_AFTER_HOURS", defaults.stale_after_hours)?,
            min_valid_year: env_parse("HISTSYNC_MIN_VALID_YEAR", defaults.min_valid_year)?,
            backup_keep: env_parse("HISTSYNC_BACKUP_KEEP", defaults.backup_keep)?,
            utc_offset_minutes: env_parse(
                "HISTSYNC_UTC_OFFSET_MINUTES",
                defaults.utc_offset_minutes,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::invalid("HISTSYNC_CIRCUIT_BREAKER", "must be at least 1"));
        }
        if self.unit_workers == 0 {
            return Err(ConfigError::invalid("HISTSYNC_UNIT_WORKERS", "must be at least 1"));
        }
        if self.settle_cycles == 0 {
            return Err(ConfigError::invalid("HISTSYNC_SETTLE_CYCLES", "must be at least 1"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid("HISTSYNC_FETCH_TIMEOUT_SECS", "must be positive"));
        }
        if !(self.fresh_max_hours > 0.0 && self.fresh_max_hours < self.stale_after_hours) {
            return Err(ConfigError::invalid(
                "HISTSYNC_FRESH_MAX_HOURS",
                format!(
                    "expected 0 < fresh ({}) < stale ({})",
                    self.fresh_max_hours, self.stale_after_hours
                ),
            ));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::invalid("HISTSYNC_UTC_OFFSET_MINUTES", "out of range"));
        }
        self.time_range()?;
        self.step_expr()?;
        Ok(())
    }

    pub fn time_range(&self) -> Result<TimeRange, ConfigError> {
        Ok(TimeRange {
            start: TimeExpr::parse(&self.start)?,
            end: TimeExpr::parse(&self.end)?,
        })
    }

    pub fn step_expr(&self) -> Result<StepExpr, ConfigError> {
        StepExpr::parse(&self.step)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn fresh_max(&self) -> ChronoDuration {
        hours_to_duration(self.fresh_max_hours)
    }

    pub fn stale_after(&self) -> ChronoDuration {
        hours_to_duration(self.stale_after_hours)
    }

    pub fn plant_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn units_manifest_path(&self) -> PathBuf {
        self.config_dir.join(UNITS_MANIFEST)
    }

    /// Tag source for a unit: explicit `tags_file` (relative to the config dir) or
    /// `tags_<slug>.txt`.
    pub fn tags_path(&self, unit: &UnitSpec) -> PathBuf {
        match &unit.tags_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.config_dir.join(path),
            None => self
                .config_dir
                .join(format!("tags_{}.txt", unit.slug().to_ascii_lowercase())),
        }
    }

    pub fn load_units(&self) -> Result<Vec<UnitSpec>> {
        load_units_manifest(&self.units_manifest_path())
    }
}

#[derive(Debug, Deserialize)]
struct UnitsManifest {
    #[serde(default)]
    units: Vec<UnitSpec>,
}

pub fn load_units_manifest(path: &Path) -> Result<Vec<UnitSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read units manifest {}", path.display()))?;
    let manifest: UnitsManifest = toml::from_str(&raw)
        .with_context(|| format!("failed to parse units manifest {}", path.display()))?;
    let mut units: Vec<UnitSpec> = Vec::with_capacity(manifest.units.len());
    for unit in manifest.units {
        if unit.unit.trim().is_empty() || unit.plant.trim().is_empty() {
            tracing::warn!(path = %path.display(), "skipping manifest entry without plant/unit");
            continue;
        }
        if units.iter().any(|existing| existing.unit == unit.unit) {
            tracing::warn!(unit = %unit.unit, "duplicate unit in manifest; keeping first");
            continue;
        }
        units.push(unit);
    }
    Ok(units)
}

fn hours_to_duration(hours: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((hours * 3_600_000.0).round() as i64)
}

fn env_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_optional(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| ConfigError::invalid(key, err.to_string())),
        None => Ok(default),
    }
}
