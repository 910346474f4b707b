use crate::config::Config;
use crate::oracle::query::OracleQuery;
use crate::oracle::session::{
    CalcState, CellRef, CellValue, OracleSession, SessionProvider, SpillBlock,
};
use crate::types::{
    parse_naive, FetchRequest, Sample, StepExpr, Tag, TimeExpr, TimeRange, UnitSpec,
};
use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Canned oracle behavior for one tag.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Settles immediately with this spill.
    Block(SpillBlock),
    /// Never reports `Done`, but the spill already holds values.
    Early(SpillBlock),
    /// Settles with an error cell.
    Token(String),
    /// Keeps calculating until the client gives up.
    Timeout,
    /// Times out on the first submission, then settles with this spill.
    TimeoutThen(SpillBlock),
    SubmitError(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    scripts: HashMap<String, Scripted>,
    current: Option<String>,
    polls: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    submitted: Arc<Mutex<Vec<String>>>,
    windows: Arc<Mutex<Vec<TimeRange>>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: &str, script: Scripted) -> Self {
        self.scripts.insert(tag.to_string(), script);
        self
    }

    pub fn polls_for(&self, tag: &str) -> u32 {
        self.polls.get(tag).copied().unwrap_or(0)
    }

    /// Shared log of submitted tags, visible after the session is moved.
    pub fn submissions(&self) -> Arc<Mutex<Vec<String>>> {
        self.submitted.clone()
    }

    /// Shared log of the time range of every submitted query.
    pub fn windows(&self) -> Arc<Mutex<Vec<TimeRange>>> {
        self.windows.clone()
    }

    fn current_script(&self) -> Scripted {
        let Some(tag) = self.current.as_ref() else {
            return Scripted::Token("#N/A".to_string());
        };
        match self.scripts.get(tag) {
            Some(Scripted::TimeoutThen(_)) if self.attempts.get(tag) == Some(&1) => {
                Scripted::Timeout
            }
            Some(Scripted::TimeoutThen(block)) => Scripted::Block(block.clone()),
            Some(script) => script.clone(),
            None => Scripted::Token("#N/A".to_string()),
        }
    }
}

impl OracleSession for ScriptedSession {
    async fn submit(&mut self, _anchor: CellRef, query: &OracleQuery) -> Result<()> {
        let tag = query.tag.as_str().to_string();
        self.submitted.lock().unwrap().push(tag.clone());
        self.windows.lock().unwrap().push(query.range.clone());
        *self.attempts.entry(tag.clone()).or_default() += 1;
        if let Some(Scripted::SubmitError(detail)) = self.scripts.get(&tag) {
            bail!("{detail}");
        }
        self.current = Some(tag);
        Ok(())
    }

    async fn calculation_state(&mut self) -> Result<CalcState> {
        if let Some(tag) = &self.current {
            *self.polls.entry(tag.clone()).or_default() += 1;
        }
        Ok(match self.current_script() {
            Scripted::Timeout | Scripted::Early(_) => CalcState::Calculating,
            _ => CalcState::Done,
        })
    }

    async fn read_spill(&mut self, _anchor: CellRef) -> Result<SpillBlock> {
        Ok(match self.current_script() {
            Scripted::Block(block) | Scripted::Early(block) => block,
            Scripted::Token(token) => SpillBlock::new(vec![vec![CellValue::Error(token)]]),
            Scripted::Timeout => SpillBlock::new(vec![vec![CellValue::text("#GETTING_DATA")]]),
            Scripted::TimeoutThen(_) | Scripted::SubmitError(_) => SpillBlock::default(),
        })
    }

    async fn clear(&mut self, _anchor: CellRef) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

/// Hands out per-unit scripted sessions and counts acquire/release.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    sessions: HashMap<String, ScriptedSession>,
    unavailable: HashSet<String>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, unit: &str, session: ScriptedSession) -> Self {
        self.sessions.insert(unit.to_string(), session);
        self
    }

    pub fn unavailable(mut self, unit: &str) -> Self {
        self.unavailable.insert(unit.to_string());
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SessionProvider for ScriptedProvider {
    type Session = ScriptedSession;

    async fn open(&self, unit: &UnitSpec) -> Result<ScriptedSession> {
        if self.unavailable.contains(&unit.unit) {
            bail!("oracle unavailable for {}", unit.unit);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.sessions.get(&unit.unit).cloned().unwrap_or_default())
    }

    async fn close(&self, _session: ScriptedSession) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn at(raw: &str) -> NaiveDateTime {
    parse_naive(raw).expect("test timestamp")
}

/// Spill rows of (spreadsheet serial, value).
pub fn spill(rows: &[(f64, Option<f64>)]) -> SpillBlock {
    SpillBlock::new(
        rows.iter()
            .map(|(serial, value)| {
                vec![
                    CellValue::Number(*serial),
                    value.map(CellValue::Number).unwrap_or(CellValue::Empty),
                ]
            })
            .collect(),
    )
}

pub fn request_for(tag: &str) -> FetchRequest {
    FetchRequest {
        unit: UnitSpec::new("PCFS", "K-31-01"),
        tag: Tag::new(tag).expect("tag"),
        range: TimeRange {
            start: TimeExpr::parse("-1d").expect("start"),
            end: TimeExpr::now(),
        },
        step: StepExpr::parse("-0.1h").expect("step"),
    }
}

pub fn sample(unit: &str, tag: &str, time: &str, value: f64) -> Sample {
    Sample {
        plant: "PCFS".to_string(),
        unit: unit.to_string(),
        tag: tag.to_string(),
        time: at(time),
        value: Some(value),
    }
}

/// Config rooted in a temp dir with fast oracle timings.
pub fn test_config(root: &Path) -> Config {
    let config = Config {
        data_dir: root.join("data"),
        config_dir: root.join("config"),
        pi_server: "TEST-PI".to_string(),
        fetch_timeout_secs: 1,
        poll_interval_ms: 2,
        settle_cycles: 1,
        ..Config::default()
    };
    std::fs::create_dir_all(&config.data_dir).expect("data dir");
    std::fs::create_dir_all(&config.config_dir).expect("config dir");
    config
}

pub fn write_tags(config: &Config, unit: &UnitSpec, tags: &[&str]) {
    let body = tags.join("\n");
    std::fs::write(config.tags_path(unit), body).expect("write tags");
}
