use crate::error::ConfigError;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Canonical sensor identifier within a unit, e.g. `PCFS.K-31-01.FI-31001.PV`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub plant: String,
    pub unit: String,
    #[serde(default)]
    pub tags_file: Option<PathBuf>,
}

impl UnitSpec {
    pub fn new(plant: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            plant: plant.into(),
            unit: unit.into(),
            tags_file: None,
        }
    }

    pub fn slug(&self) -> String {
        slug(&self.unit)
    }
}

/// Filesystem-safe form of a unit id (`07-MT01/K001` -> `07-MT01_K001`).
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_ws = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            if !last_ws {
                out.push('_');
            }
            last_ws = true;
            continue;
        }
        last_ws = false;
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// One long-format record. `time` is plant-local and timezone-naive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub plant: String,
    pub unit: String,
    pub tag: String,
    pub time: NaiveDateTime,
    pub value: Option<f64>,
}

impl Sample {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            time: self.time,
            unit: self.unit.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Natural key of a sample. Field order doubles as the master sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleKey {
    pub time: NaiveDateTime,
    pub unit: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimeExprKind {
    Now,
    Relative(Duration),
    Absolute(NaiveDateTime),
}

/// Oracle time expression: `*`, `-1d`, `*-4h`, or an absolute timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeExpr {
    text: String,
    kind: TimeExprKind,
}

impl TimeExpr {
    pub fn now() -> Self {
        Self {
            text: "*".to_string(),
            kind: TimeExprKind::Now,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let text = raw.trim().to_string();
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if compact == "*" {
            return Ok(Self::now());
        }
        let relative = compact.strip_prefix('*').unwrap_or(&compact);
        if let Some(rest) = relative.strip_prefix('-') {
            let offset = parse_span(rest).ok_or_else(|| {
                ConfigError::invalid("time", format!("unrecognized relative time {text:?}"))
            })?;
            return Ok(Self {
                text,
                kind: TimeExprKind::Relative(offset),
            });
        }
        let absolute = parse_naive(&text).ok_or_else(|| {
            ConfigError::invalid("time", format!("unrecognized time expression {text:?}"))
        })?;
        Ok(Self {
            text,
            kind: TimeExprKind::Absolute(absolute),
        })
    }

    /// Absolute expression for `at`, truncated to whole seconds.
    pub fn at(at: NaiveDateTime) -> Self {
        let text = at.format("%Y-%m-%d %H:%M:%S").to_string();
        let kind = TimeExprKind::Absolute(parse_naive(&text).unwrap_or(at));
        Self { text, kind }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn resolve(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self.kind {
            TimeExprKind::Now => now,
            TimeExprKind::Relative(offset) => now - offset,
            TimeExprKind::Absolute(at) => at,
        }
    }
}

impl fmt::Display for TimeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Sampling interval, written the oracle way (`-0.1h`, `-6m`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExpr {
    text: String,
}

impl StepExpr {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let text = raw.trim().to_string();
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let body = compact.strip_prefix('-').unwrap_or(&compact);
        if !parse_span(body).is_some_and(|d| d > Duration::zero()) {
            return Err(ConfigError::invalid("step", format!("unrecognized step {text:?}")));
        }
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for StepExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimeExpr,
    pub end: TimeExpr,
}

/// One oracle query for one tag. Lives for a single orchestration step.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub unit: UnitSpec,
    pub tag: Tag,
    pub range: TimeRange,
    pub step: StepExpr,
}

/// `1.5h`, `30m`, `1y` (365 days), `2d`, `45s`.
fn parse_span(raw: &str) -> Option<Duration> {
    let (split, unit) = raw.char_indices().last()?;
    let unit = unit.to_ascii_lowercase();
    let number = raw[..split].trim();
    if number.is_empty() {
        return None;
    }
    let amount: f64 = number.parse().ok()?;
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    let seconds_per_unit = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3_600.0,
        'd' => 86_400.0,
        'w' => 7.0 * 86_400.0,
        'y' => 365.0 * 86_400.0,
        _ => return None,
    };
    let millis = (amount * seconds_per_unit * 1000.0).round() as i64;
    Some(Duration::milliseconds(millis))
}

pub(crate) fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%d-%b-%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];
    let trimmed = raw.trim();
    for format in FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> NaiveDateTime {
        parse_naive(raw).unwrap()
    }

    #[test]
    fn slug_replaces_separators() {
        assert_eq!(slug("07-MT01/K001"), "07-MT01_K001");
        assert_eq!(slug("  K 31  01 "), "K_31_01");
        assert_eq!(slug("XT-07002"), "XT-07002");
    }

    #[test]
    fn relative_time_expressions_resolve_against_now() {
        let now = at("2025-03-10 12:00:00");
        assert_eq!(TimeExpr::parse("-1d").unwrap().resolve(now), at("2025-03-09 12:00:00"));
        assert_eq!(TimeExpr::parse("*-4h").unwrap().resolve(now), at("2025-03-10 08:00:00"));
        assert_eq!(TimeExpr::parse("- 30m").unwrap().resolve(now), at("2025-03-10 11:30:00"));
        assert_eq!(TimeExpr::parse("*").unwrap().resolve(now), now);
        assert_eq!(
            TimeExpr::parse("2025-01-01").unwrap().resolve(now),
            at("2025-01-01 00:00:00")
        );
    }

    #[test]
    fn absolute_expressions_drop_subseconds() {
        let expr = TimeExpr::at(at("2025-03-07 06:30:15.250"));
        assert_eq!(expr.as_str(), "2025-03-07 06:30:15");
        assert_eq!(expr.resolve(at("2025-03-10 12:00:00")), at("2025-03-07 06:30:15"));
        assert_eq!(TimeExpr::parse(expr.as_str()).unwrap(), expr);
    }

    #[test]
    fn bad_time_expressions_are_config_errors() {
        assert!(TimeExpr::parse("-4x").is_err());
        assert!(TimeExpr::parse("yesterday").is_err());
        assert!(TimeExpr::parse("-h").is_err());
    }

    #[test]
    fn steps_accept_oracle_notation() {
        assert_eq!(StepExpr::parse("-0.1h").unwrap().as_str(), "-0.1h");
        assert!(StepExpr::parse("5m").is_ok());
        assert!(StepExpr::parse("-0h").is_err());
        assert!(StepExpr::parse("fast").is_err());
    }

    #[test]
    fn tags_are_trimmed_and_never_empty() {
        assert_eq!(Tag::new("  A.B.PV ").unwrap().as_str(), "A.B.PV");
        assert!(Tag::new("   ").is_none());
    }
}
