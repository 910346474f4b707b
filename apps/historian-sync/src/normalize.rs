use crate::config::Config;
use crate::oracle::client::{classify_token, RawRow, RawTable, WideRow};
use crate::oracle::session::CellValue;
use crate::types::{parse_naive, Sample};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Largest serial day a spreadsheet can represent (9999-12-31).
const MAX_SERIAL_DAY: f64 = 2_958_465.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Samples strictly before this instant are rejected.
    pub min_valid_time: NaiveDateTime,
    /// Offset that zone-aware timestamps are shifted into before dropping the zone.
    pub utc_offset: FixedOffset,
}

impl NormalizeOptions {
    pub fn new(min_valid_year: i32, utc_offset: FixedOffset) -> Self {
        let min_valid_time = NaiveDate::from_ymd_opt(min_valid_year, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or(NaiveDateTime::MIN);
        Self {
            min_valid_time,
            utc_offset,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.min_valid_year, config.plant_offset())
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::new(2000, Utc.fix())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub emitted: u64,
    pub dropped_malformed: u64,
    pub rejected_before_floor: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    options: NormalizeOptions,
}

impl Normalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    /// Consumes a response; samples are produced lazily as the result is iterated.
    pub fn normalize(&self, plant: &str, unit: &str, tag: &str, table: RawTable) -> Normalized {
        let source = match table {
            RawTable::Long { rows } => Source::Long {
                tag: tag.to_string(),
                rows: rows.into_iter(),
            },
            RawTable::Wide { tags, rows } => Source::Wide {
                tags,
                rows: rows.into_iter(),
                current: None,
            },
        };
        Normalized {
            plant: plant.to_string(),
            unit: unit.to_string(),
            options: self.options,
            source,
            stats: NormalizeStats::default(),
            warned: HashSet::new(),
        }
    }
}

enum Source {
    Long {
        tag: String,
        rows: std::vec::IntoIter<RawRow>,
    },
    Wide {
        tags: Vec<String>,
        rows: std::vec::IntoIter<WideRow>,
        current: Option<(NaiveDateTime, std::iter::Enumerate<std::vec::IntoIter<CellValue>>)>,
    },
}

/// One-shot stream of samples from a single response.
pub struct Normalized {
    plant: String,
    unit: String,
    options: NormalizeOptions,
    source: Source,
    stats: NormalizeStats,
    warned: HashSet<String>,
}

impl Normalized {
    pub fn stats(&self) -> NormalizeStats {
        self.stats
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped_malformed
    }

    pub fn rejected_before_floor(&self) -> u64 {
        self.stats.rejected_before_floor
    }

    fn emit(&mut self, tag: &str, time: NaiveDateTime, value: f64) -> Sample {
        self.stats.emitted += 1;
        Sample {
            plant: self.plant.clone(),
            unit: self.unit.clone(),
            tag: tag.to_string(),
            time,
            value: Some(value),
        }
    }

    fn reject_before_floor(&mut self, tag: &str, time: NaiveDateTime) {
        self.stats.rejected_before_floor += 1;
        if self.warned.insert(tag.to_string()) {
            tracing::warn!(
                unit = %self.unit,
                tag,
                %time,
                floor = %self.options.min_valid_time,
                "rejecting samples before the valid time floor"
            );
        }
    }

    fn next_long(&mut self) -> Option<Sample> {
        loop {
            let (tag, row) = match &mut self.source {
                Source::Long { tag, rows } => (tag.clone(), rows.next()?),
                Source::Wide { .. } => return None,
            };
            let time = coerce_time(&row.time, self.options.utc_offset);
            let value = coerce_value(&row.value);
            match (time, value) {
                (Some(time), Some(_)) if time < self.options.min_valid_time => {
                    self.reject_before_floor(&tag, time);
                }
                (Some(time), Some(value)) => return Some(self.emit(&tag, time, value)),
                _ => self.stats.dropped_malformed += 1,
            }
        }
    }

    fn next_wide(&mut self) -> Option<Sample> {
        loop {
            let offset = self.options.utc_offset;
            let (tag, time, cell) = match &mut self.source {
                Source::Long { .. } => return None,
                Source::Wide {
                    tags,
                    rows,
                    current,
                } => {
                    if let Some((time, cells)) = current {
                        if let Some((idx, cell)) = cells.next() {
                            let tag = match tags.get(idx) {
                                Some(tag) => tag.clone(),
                                None => continue,
                            };
                            (tag, *time, cell)
                        } else {
                            *current = None;
                            continue;
                        }
                    } else {
                        let row = rows.next()?;
                        if row.values.iter().all(CellValue::is_empty) {
                            continue;
                        }
                        match coerce_time(&row.time, offset) {
                            Some(time) => {
                                *current = Some((time, row.values.into_iter().enumerate()));
                            }
                            None => {
                                let lost = row.values.iter().filter(|v| !v.is_empty()).count();
                                self.stats.dropped_malformed += lost as u64;
                            }
                        }
                        continue;
                    }
                }
            };
            if cell.is_empty() {
                continue;
            }
            match coerce_value(&cell) {
                Some(_) if time < self.options.min_valid_time => {
                    self.reject_before_floor(&tag, time)
                }
                Some(value) => return Some(self.emit(&tag, time, value)),
                None => self.stats.dropped_malformed += 1,
            }
        }
    }
}

impl Iterator for Normalized {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        match self.source {
            Source::Long { .. } => self.next_long(),
            Source::Wide { .. } => self.next_wide(),
        }
    }
}

/// Spreadsheet serial day (epoch 1899-12-30) to a naive timestamp, millisecond precision.
pub fn from_serial_days(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= 0.0 || serial > MAX_SERIAL_DAY {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}

fn coerce_time(cell: &CellValue, offset: FixedOffset) -> Option<NaiveDateTime> {
    match cell {
        CellValue::DateTime(time) => Some(*time),
        CellValue::Number(serial) => from_serial_days(*serial),
        CellValue::Text(raw) => {
            let raw = raw.trim();
            if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
                return Some(zoned.with_timezone(&offset).naive_local());
            }
            parse_naive(raw).or_else(|| raw.parse::<f64>().ok().and_then(from_serial_days))
        }
        CellValue::Empty | CellValue::Error(_) => None,
    }
}

fn coerce_value(cell: &CellValue) -> Option<f64> {
    if let Some(token) = cell.token() {
        if classify_token(token).is_some() {
            return None;
        }
    }
    cell.as_number()
}

/// Long samples re-pivoted to one column per tag.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    pub tags: Vec<String>,
    pub rows: Vec<(NaiveDateTime, Vec<Option<f64>>)>,
}

impl WideTable {
    pub fn into_raw(self) -> RawTable {
        RawTable::Wide {
            tags: self.tags,
            rows: self
                .rows
                .into_iter()
                .map(|(time, values)| WideRow {
                    time: CellValue::DateTime(time),
                    values: values
                        .into_iter()
                        .map(|v| v.map(CellValue::Number).unwrap_or(CellValue::Empty))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Columns are tags in sorted order; rows are distinct times ascending.
pub fn pivot_to_wide(samples: &[Sample]) -> WideTable {
    let tags: Vec<String> = samples
        .iter()
        .map(|s| s.tag.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let column: BTreeMap<&str, usize> = tags
        .iter()
        .enumerate()
        .map(|(idx, tag)| (tag.as_str(), idx))
        .collect();

    let mut by_time: BTreeMap<NaiveDateTime, Vec<Option<f64>>> = BTreeMap::new();
    for sample in samples {
        let Some(&idx) = column.get(sample.tag.as_str()) else {
            continue;
        };
        let row = by_time
            .entry(sample.time)
            .or_insert_with(|| vec![None; tags.len()]);
        row[idx] = sample.value;
    }
    by_time.retain(|_, values| values.iter().any(Option::is_some));
    WideTable {
        tags,
        rows: by_time.into_iter().collect(),
    }
}

/// Wide CSV export: first column is time, every other column a tag.
pub fn read_wide_csv(path: &Path) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open wide export {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    if headers.len() < 2 {
        return Err(anyhow!(
            "wide export {} needs a time column and at least one tag column",
            path.display()
        ));
    }
    let tags: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read row of {}", path.display()))?;
        let time = record
            .get(0)
            .map(|raw| CellValue::text(raw))
            .unwrap_or(CellValue::Empty);
        let values = (1..=tags.len())
            .map(|idx| match record.get(idx) {
                Some(raw) if !raw.is_empty() => CellValue::text(raw),
                _ => CellValue::Empty,
            })
            .collect();
        rows.push(WideRow { time, values });
    }
    Ok(RawTable::Wide { tags, rows })
}
