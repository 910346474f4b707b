use crate::config::Config;
use crate::error::RunError;
use crate::freshness::FreshnessReport;
use crate::oracle::WebApiProvider;
use crate::orchestrator::{FetchOrchestrator, RunState, RunSummary};
use crate::types::UnitSpec;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "historian-sync",
    version,
    about = "Fetch historian tags into deduplicated per-unit Parquet masters"
)]
pub struct Cli {
    /// Restrict to these units (comma separated); default is every unit in the manifest.
    #[arg(long, global = true, value_delimiter = ',')]
    pub units: Vec<String>,
    #[arg(long, global = true, env = "HISTSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "HISTSYNC_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch every tag of each unit and merge into its master.
    Fetch(WindowArgs),
    /// Report freshness of each unit master.
    Status(StatusArgs),
    /// Merge a long-format parquet produced elsewhere.
    Merge(MergeArgs),
    /// Pivot a wide CSV export and merge it.
    ImportWide(ImportWideArgs),
    /// Fetch only units whose master is not FRESH.
    RefreshStale(WindowArgs),
    /// Back up and drop a unit master, then fetch it from scratch.
    Rebuild(RebuildArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct WindowArgs {
    #[arg(long, env = "HISTSYNC_START")]
    pub start: Option<String>,
    #[arg(long, env = "HISTSYNC_END")]
    pub end: Option<String>,
    #[arg(long, env = "HISTSYNC_STEP")]
    pub step: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value_t = false)]
    pub per_tag: bool,
    #[arg(long, default_value_t = false)]
    pub json: bool,
    /// Also write the report as JSON to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    #[arg(long)]
    pub unit: String,
    #[arg(long = "new")]
    pub source: PathBuf,
    #[arg(long, default_value_t = false)]
    pub keep_source: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ImportWideArgs {
    #[arg(long)]
    pub unit: String,
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RebuildArgs {
    #[arg(long)]
    pub unit: String,
    #[command(flatten)]
    pub window: WindowArgs,
}

impl Cli {
    /// Applies directory overrides on top of the environment config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.config_dir {
            config.config_dir = dir.clone();
        }
    }
}

impl WindowArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(start) = &self.start {
            config.start = start.clone();
        }
        if let Some(end) = &self.end {
            config.end = end.clone();
        }
        if let Some(step) = &self.step {
            config.step = step.clone();
        }
    }
}

/// Manifest units, narrowed to `filter` when it is non-empty.
pub fn select_units(all: Vec<UnitSpec>, filter: &[String]) -> Result<Vec<UnitSpec>> {
    if filter.is_empty() {
        return Ok(all);
    }
    let mut selected = Vec::with_capacity(filter.len());
    for name in filter {
        let name = name.trim();
        let unit = all
            .iter()
            .find(|unit| unit.unit == name || unit.slug() == name)
            .ok_or_else(|| anyhow!("unit {name} is not in the units manifest"))?;
        if !selected.contains(unit) {
            selected.push(unit.clone());
        }
    }
    Ok(selected)
}

fn find_unit(config: &Config, name: &str) -> Result<UnitSpec> {
    let units = config.load_units()?;
    select_units(units, &[name.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("unit {name} is not in the units manifest"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct UnitResult<'a> {
    unit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// 0 when every unit finished, 1 when any aborted on the circuit breaker, 2 on run errors.
pub fn runs_exit_code(results: &[(UnitSpec, Result<RunSummary, RunError>)]) -> i32 {
    results
        .iter()
        .map(|(_, result)| match result {
            Ok(summary) if summary.state == RunState::Done => 0,
            Ok(_) => 1,
            Err(_) => 2,
        })
        .max()
        .unwrap_or(0)
}

fn report_runs(results: &[(UnitSpec, Result<RunSummary, RunError>)]) -> Result<i32> {
    let rows: Vec<UnitResult<'_>> = results
        .iter()
        .map(|(unit, result)| UnitResult {
            unit: &unit.unit,
            summary: result.as_ref().ok(),
            error: result.as_ref().err().map(|err| err.to_string()),
        })
        .collect();
    print_json(&rows)?;
    Ok(runs_exit_code(results))
}

fn print_status(report: &FreshnessReport, per_tag: bool) {
    println!(
        "{:<20} {:<8} {:<20} {:>9}",
        "UNIT", "STATUS", "LATEST", "AGE_H"
    );
    for unit in &report.units {
        let rows = std::iter::once(&unit.record).chain(unit.tags.iter().filter(|_| per_tag));
        for record in rows {
            let name = match &record.tag {
                Some(tag) => format!("  {tag}"),
                None => record.unit.clone(),
            };
            let latest = record
                .latest_time
                .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let age = record
                .age
                .map(|age| format!("{:.1}", age.num_seconds() as f64 / 3600.0))
                .unwrap_or_else(|| "-".to_string());
            println!("{name:<20} {:<8} {latest:<20} {age:>9}", record.status.as_str());
        }
    }
    println!("overall: {}", report.overall);
}

/// Executes one command and returns the process exit code.
pub async fn run(cli: Cli, mut config: Config, cancel: CancellationToken) -> Result<i32> {
    cli.apply(&mut config);
    match &cli.command {
        Commands::Fetch(window) => {
            window.apply(&mut config);
            let units = select_units(config.load_units()?, &cli.units)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let provider = WebApiProvider::from_config(&config)?;
            let results = orchestrator.run_units(&provider, &units, &cancel).await;
            report_runs(&results)
        }
        Commands::RefreshStale(window) => {
            window.apply(&mut config);
            let units = select_units(config.load_units()?, &cli.units)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let provider = WebApiProvider::from_config(&config)?;
            let results = orchestrator.refresh_stale(&provider, &units, &cancel).await;
            report_runs(&results)
        }
        Commands::Rebuild(args) => {
            args.window.apply(&mut config);
            let unit = find_unit(&config, &args.unit)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let provider = WebApiProvider::from_config(&config)?;
            let result = orchestrator.rebuild(&provider, &unit, &cancel).await;
            report_runs(&[(unit, result)])
        }
        Commands::Status(args) => {
            let units = select_units(config.load_units()?, &cli.units)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let report = orchestrator.status(&units, args.per_tag).await;
            if let Some(path) = &args.report {
                report
                    .write_json(path)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                tracing::info!(path = %path.display(), "freshness report written");
            }
            if args.json {
                print_json(&report)?;
            } else {
                print_status(&report, args.per_tag);
            }
            Ok(report.exit_code())
        }
        Commands::Merge(args) => {
            let unit = find_unit(&config, &args.unit)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let outcome = orchestrator
                .merge_external(&unit, &args.source, args.keep_source)
                .await?;
            print_json(&outcome)?;
            Ok(0)
        }
        Commands::ImportWide(args) => {
            let unit = find_unit(&config, &args.unit)?;
            let orchestrator = FetchOrchestrator::new(&config)?;
            let summary = orchestrator.import_wide(&unit, &args.file).await?;
            print_json(&summary)?;
            Ok(0)
        }
    }
}
