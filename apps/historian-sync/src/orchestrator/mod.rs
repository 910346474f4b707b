use crate::catalog::TagCatalog;
use crate::config::Config;
use crate::error::{ConfigError, MergeError, OracleFailure, OracleFailureKind, RunError};
use crate::freshness::{FreshnessClassifier, FreshnessReport, UnitFreshness};
use crate::master::{MasterStore, MergeOutcome};
use crate::normalize::{read_wide_csv, NormalizeOptions, Normalizer};
use crate::oracle::client::OracleClient;
use crate::oracle::session::{OracleSession, SessionProvider};
use crate::types::{FetchRequest, Sample, StepExpr, Tag, TimeExpr, TimeRange, UnitSpec};
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Fetching(usize),
    Normalizing,
    Merging,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub tags_attempted: u64,
    pub tags_succeeded: u64,
    pub tags_failed_timeout: u64,
    pub tags_failed_sentinel: u64,
    pub tags_failed_empty: u64,
    pub tags_failed_session: u64,
    pub tags_recovered_on_retry: u64,
    pub samples_merged: u64,
    pub samples_dropped_malformed: u64,
    pub samples_rejected_before_floor: u64,
}

impl RunCounters {
    pub fn tags_failed(&self) -> u64 {
        self.tags_failed_timeout
            + self.tags_failed_sentinel
            + self.tags_failed_empty
            + self.tags_failed_session
    }

    fn failure_counter(&mut self, kind: OracleFailureKind) -> &mut u64 {
        match kind {
            OracleFailureKind::Timeout => &mut self.tags_failed_timeout,
            OracleFailureKind::InvalidTag | OracleFailureKind::NotFound => {
                &mut self.tags_failed_sentinel
            }
            OracleFailureKind::Empty => &mut self.tags_failed_empty,
            OracleFailureKind::Session => &mut self.tags_failed_session,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub plant: String,
    pub unit: String,
    pub state: RunState,
    pub counters: RunCounters,
    pub failures: Vec<OracleFailure>,
    pub merge: Option<MergeOutcome>,
    pub freshness: Option<UnitFreshness>,
}

impl RunSummary {
    pub fn aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub unit: String,
    pub samples: u64,
    pub dropped_malformed: u64,
    pub rejected_before_floor: u64,
    pub merge: MergeOutcome,
}

enum TagOutcome {
    Fetched,
    Failed,
    Cancelled,
}

/// Mutable state of one unit run.
struct UnitRun<'a> {
    unit: &'a UnitSpec,
    range: TimeRange,
    state: RunState,
    counters: RunCounters,
    samples: Vec<Sample>,
    failures: Vec<OracleFailure>,
    consecutive_failures: u32,
}

impl<'a> UnitRun<'a> {
    fn new(unit: &'a UnitSpec, range: TimeRange) -> Self {
        Self {
            unit,
            range,
            state: RunState::Init,
            counters: RunCounters::default(),
            samples: Vec::new(),
            failures: Vec::new(),
            consecutive_failures: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = ?self.state, to = ?next, "unit run state");
        self.state = next;
    }
}

/// Sequences catalog, oracle, normalizer, merge and freshness for whole units.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    config: Config,
    client: OracleClient,
    normalizer: Normalizer,
    store: MasterStore,
    classifier: FreshnessClassifier,
    range: TimeRange,
    step: StepExpr,
}

impl FetchOrchestrator {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            client: OracleClient::from_config(config),
            normalizer: Normalizer::new(NormalizeOptions::from_config(config)),
            store: MasterStore::from_config(config),
            classifier: FreshnessClassifier::from_config(config),
            range: config.time_range()?,
            step: config.step_expr()?,
        })
    }

    pub fn store(&self) -> &MasterStore {
        &self.store
    }

    pub async fn run_unit<P: SessionProvider>(
        &self,
        provider: &P,
        unit: &UnitSpec,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        self.run_unit_over(provider, unit, self.range.clone(), cancel).await
    }

    async fn run_unit_over<P: SessionProvider>(
        &self,
        provider: &P,
        unit: &UnitSpec,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let span = tracing::info_span!(
            "unit_run",
            plant = %unit.plant,
            unit = %unit.unit,
            start = %range.start,
            end = %range.end
        );
        self.run_unit_inner(provider, unit, range, cancel).instrument(span).await
    }

    async fn run_unit_inner<P: SessionProvider>(
        &self,
        provider: &P,
        unit: &UnitSpec,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let mut run = UnitRun::new(unit, range);
        let catalog = TagCatalog::load(&self.config, unit)?;
        tracing::info!(
            tags = catalog.tags().len(),
            catalog = %catalog.source().display(),
            data_dir = %self.store.data_dir().display(),
            "starting unit run"
        );

        let mut session = provider.open(unit).await.map_err(|err| RunError::Session {
            unit: unit.unit.clone(),
            detail: format!("{err:#}"),
        })?;
        let completed = self.fetch_all(&mut session, &mut run, catalog.tags(), cancel).await;
        if let Err(err) = provider.close(session).await {
            tracing::warn!(error = %err, "failed to release oracle session");
        }
        if !completed {
            tracing::warn!("unit run cancelled before merge; master untouched");
            return Err(RunError::Cancelled {
                unit: unit.unit.clone(),
            });
        }

        let aborted = run.state == RunState::Aborted;
        run.transition(RunState::Merging);
        let samples = std::mem::take(&mut run.samples);
        let merge = self.store.commit(unit, samples).await?;
        if let MergeOutcome::Committed(report) = &merge {
            run.counters.samples_merged = report.new_samples as u64;
        }

        let freshness = self
            .classifier
            .check_unit(unit, self.classifier.now(), Some(catalog.tags().to_vec()))
            .await;
        run.transition(if aborted { RunState::Aborted } else { RunState::Done });

        let counters = run.counters;
        tracing::info!(
            state = ?run.state,
            attempted = counters.tags_attempted,
            succeeded = counters.tags_succeeded,
            failed_timeout = counters.tags_failed_timeout,
            failed_sentinel = counters.tags_failed_sentinel,
            failed_empty = counters.tags_failed_empty,
            failed_session = counters.tags_failed_session,
            samples_merged = counters.samples_merged,
            dropped_malformed = counters.samples_dropped_malformed,
            rejected_before_floor = counters.samples_rejected_before_floor,
            freshness = %freshness.status(),
            "unit run finished"
        );
        Ok(RunSummary {
            plant: unit.plant.clone(),
            unit: unit.unit.clone(),
            state: run.state,
            counters,
            failures: run.failures,
            merge: Some(merge),
            freshness: Some(freshness),
        })
    }

    /// Main pass plus retry passes over timed-out tags. Returns false when cancelled.
    async fn fetch_all<S: OracleSession>(
        &self,
        session: &mut S,
        run: &mut UnitRun<'_>,
        tags: &[Tag],
        cancel: &CancellationToken,
    ) -> bool {
        let threshold = self.config.circuit_breaker_threshold.max(1);
        for (idx, tag) in tags.iter().enumerate() {
            run.transition(RunState::Fetching(idx));
            run.counters.tags_attempted += 1;
            match self.fetch_tag(session, run, tag, cancel).await {
                TagOutcome::Cancelled => return false,
                TagOutcome::Fetched => {}
                TagOutcome::Failed if run.consecutive_failures >= threshold => {
                    tracing::error!(
                        consecutive = run.consecutive_failures,
                        remaining = tags.len() - idx - 1,
                        "circuit breaker tripped; aborting unit run"
                    );
                    run.transition(RunState::Aborted);
                    return true;
                }
                TagOutcome::Failed => {}
            }
        }

        for pass in 1..=self.config.retry_passes {
            let retry: Vec<Tag> = run
                .failures
                .iter()
                .filter(|f| f.kind == OracleFailureKind::Timeout)
                .filter_map(|f| Tag::new(&f.tag))
                .collect();
            if retry.is_empty() {
                break;
            }
            tracing::info!(pass, tags = retry.len(), "retrying timed-out tags");
            run.consecutive_failures = 0;
            for (idx, tag) in retry.iter().enumerate() {
                run.transition(RunState::Fetching(idx));
                // The earlier timeout stays recorded unless this attempt replaces it.
                let previous = run
                    .failures
                    .iter()
                    .position(|f| f.tag == tag.as_str() && f.kind == OracleFailureKind::Timeout);
                let Some(previous) = previous else { continue };
                let earlier = run.failures.remove(previous);
                run.counters.tags_failed_timeout -= 1;
                match self.fetch_tag(session, run, tag, cancel).await {
                    TagOutcome::Cancelled => {
                        run.failures.push(earlier);
                        run.counters.tags_failed_timeout += 1;
                        return false;
                    }
                    TagOutcome::Fetched => {
                        run.counters.tags_recovered_on_retry += 1;
                    }
                    TagOutcome::Failed if run.consecutive_failures >= threshold => {
                        tracing::error!(
                            pass,
                            "circuit breaker tripped during retry; aborting unit run"
                        );
                        run.transition(RunState::Aborted);
                        return true;
                    }
                    TagOutcome::Failed => {}
                }
            }
        }
        true
    }

    async fn fetch_tag<S: OracleSession>(
        &self,
        session: &mut S,
        run: &mut UnitRun<'_>,
        tag: &Tag,
        cancel: &CancellationToken,
    ) -> TagOutcome {
        let request = FetchRequest {
            unit: run.unit.clone(),
            tag: tag.clone(),
            range: run.range.clone(),
            step: self.step.clone(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return TagOutcome::Cancelled,
            result = self.client.fetch(session, &request) => result,
        };

        match result {
            Ok(table) => {
                run.transition(RunState::Normalizing);
                let mut normalized =
                    self.normalizer
                        .normalize(&run.unit.plant, &run.unit.unit, tag.as_str(), table);
                run.samples.extend(normalized.by_ref());
                let stats = normalized.stats();
                run.counters.samples_dropped_malformed += stats.dropped_malformed;
                run.counters.samples_rejected_before_floor += stats.rejected_before_floor;
                run.counters.tags_succeeded += 1;
                run.consecutive_failures = 0;
                tracing::debug!(
                    tag = %tag,
                    samples = stats.emitted,
                    dropped = stats.dropped_malformed,
                    "tag fetched"
                );
                TagOutcome::Fetched
            }
            Err(failure) => {
                tracing::warn!(
                    tag = %tag,
                    kind = %failure.kind,
                    detail = %failure.detail,
                    "tag fetch failed"
                );
                let kind = failure.kind;
                *run.counters.failure_counter(kind) += 1;
                run.failures.push(failure);
                run.consecutive_failures += 1;
                TagOutcome::Failed
            }
        }
    }

    /// Runs units concurrently, bounded by `unit_workers`, one session per unit.
    /// Results come back in input order.
    pub async fn run_units<P: SessionProvider>(
        &self,
        provider: &P,
        units: &[UnitSpec],
        cancel: &CancellationToken,
    ) -> Vec<(UnitSpec, Result<RunSummary, RunError>)> {
        let planned = units
            .iter()
            .map(|unit| (unit.clone(), self.range.clone()))
            .collect();
        self.run_planned(provider, planned, cancel).await
    }

    async fn run_planned<P: SessionProvider>(
        &self,
        provider: &P,
        planned: Vec<(UnitSpec, TimeRange)>,
        cancel: &CancellationToken,
    ) -> Vec<(UnitSpec, Result<RunSummary, RunError>)> {
        let workers = self.config.unit_workers.max(1);
        let mut results: Vec<(usize, UnitSpec, Result<RunSummary, RunError>)> =
            stream::iter(planned.into_iter().enumerate())
                .map(|(idx, (unit, range))| async move {
                    let result = self.run_unit_over(provider, &unit, range, cancel).await;
                    if let Err(err) = &result {
                        tracing::error!(unit = %unit.unit, error = %err, "unit run failed");
                    }
                    (idx, unit, result)
                })
                .buffer_unordered(workers)
                .collect()
                .await;
        results.sort_by_key(|(idx, _, _)| *idx);
        results
            .into_iter()
            .map(|(_, unit, result)| (unit, result))
            .collect()
    }

    pub async fn status(&self, units: &[UnitSpec], per_tag: bool) -> FreshnessReport {
        let now = self.classifier.now();
        let mut records = Vec::with_capacity(units.len());
        for unit in units {
            let catalog = if per_tag {
                match TagCatalog::load(&self.config, unit) {
                    Ok(catalog) => Some(catalog.tags().to_vec()),
                    Err(err) => {
                        tracing::warn!(
                            unit = %unit.unit,
                            error = %err,
                            "no catalog for per-tag status"
                        );
                        None
                    }
                }
            } else {
                None
            };
            let mut record = self.classifier.check_unit(unit, now, catalog).await;
            if !per_tag {
                record.tags.clear();
            }
            records.push(record);
        }
        FreshnessReport::new(now, self.classifier.thresholds(), records)
    }

    /// Fetches only the units whose master is not FRESH. A unit whose newest
    /// sample predates the configured window is fetched from that sample on.
    pub async fn refresh_stale<P: SessionProvider>(
        &self,
        provider: &P,
        units: &[UnitSpec],
        cancel: &CancellationToken,
    ) -> Vec<(UnitSpec, Result<RunSummary, RunError>)> {
        let report = self.status(units, false).await;
        let due: Vec<(UnitSpec, TimeRange)> = units
            .iter()
            .zip(report.units.iter())
            .filter(|(_, freshness)| freshness.status().needs_refresh())
            .map(|(unit, freshness)| {
                let range = self.refresh_range(freshness, report.generated_at);
                tracing::info!(
                    unit = %unit.unit,
                    status = %freshness.status(),
                    start = %range.start,
                    "unit due for refresh"
                );
                (unit.clone(), range)
            })
            .collect();
        if due.is_empty() {
            tracing::info!("all units fresh; nothing to refresh");
            return Vec::new();
        }
        self.run_planned(provider, due, cancel).await
    }

    /// Window covering the gap since the unit's newest sample. Units with no
    /// readable master use the configured window.
    fn refresh_range(&self, freshness: &UnitFreshness, now: NaiveDateTime) -> TimeRange {
        let record = &freshness.record;
        let latest = record.latest_time.filter(|_| !record.from_file_metadata);
        match latest {
            Some(latest) if latest < self.range.start.resolve(now) => TimeRange {
                start: TimeExpr::at(latest),
                end: self.range.end.clone(),
            },
            _ => self.range.clone(),
        }
    }

    /// Drops the unit master (after backing it up) and fetches it again.
    pub async fn rebuild<P: SessionProvider>(
        &self,
        provider: &P,
        unit: &UnitSpec,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        TagCatalog::load(&self.config, unit)?;
        let backups = self.store.drop_master(unit).await?;
        tracing::warn!(
            unit = %unit.unit,
            backups = backups.len(),
            "rebuilding unit master from scratch"
        );
        self.run_unit(provider, unit, cancel).await
    }

    /// Pivots a wide CSV export to long samples and merges them.
    pub async fn import_wide(
        &self,
        unit: &UnitSpec,
        path: &Path,
    ) -> Result<ImportSummary, RunError> {
        let table = read_wide_csv(path).map_err(|err| ConfigError::Unreadable {
            path: path.to_path_buf(),
            detail: format!("{err:#}"),
        })?;
        let mut normalized = self.normalizer.normalize(&unit.plant, &unit.unit, "", table);
        let samples: Vec<Sample> = normalized.by_ref().collect();
        let stats = normalized.stats();
        tracing::info!(
            unit = %unit.unit,
            samples = stats.emitted,
            dropped = stats.dropped_malformed,
            rejected = stats.rejected_before_floor,
            "pivoted wide export"
        );
        let merge = self.store.commit(unit, samples).await.map_err(RunError::from)?;
        Ok(ImportSummary {
            unit: unit.unit.clone(),
            samples: stats.emitted,
            dropped_malformed: stats.dropped_malformed,
            rejected_before_floor: stats.rejected_before_floor,
            merge,
        })
    }

    pub async fn merge_external(
        &self,
        unit: &UnitSpec,
        source: &Path,
        keep_source: bool,
    ) -> Result<MergeOutcome, MergeError> {
        self.store.merge_external(unit, source, keep_source).await
    }
}
