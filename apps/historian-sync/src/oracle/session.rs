use super::query::OracleQuery;
use crate::types::UnitSpec;
use anyhow::Result;
use chrono::NaiveDateTime;
use std::fmt;

/// Top-left cell of a spilled result. `A2` by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl Default for CellRef {
    fn default() -> Self {
        Self::new(2, 1)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut col = self.col;
        let mut letters = Vec::new();
        while col > 0 {
            let rem = ((col - 1) % 26) as u8;
            letters.push((b'A' + rem) as char);
            col = (col - 1) / 26;
        }
        letters.reverse();
        let letters: String = letters.into_iter().collect();
        write!(f, "{letters}{}", self.row)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    DateTime(NaiveDateTime),
    /// Error cell as displayed, e.g. `#N/A`.
    Error(String),
}

impl CellValue {
    pub fn text(raw: impl Into<String>) -> Self {
        Self::Text(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) if value.is_finite() => Some(*value),
            Self::Text(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Textual token for sentinel matching.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.trim()),
            Self::Error(text) => Some(text.trim()),
            _ => None,
        }
    }
}

/// Cells below and right of the anchor, row-major, as read back from the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpillBlock {
    pub rows: Vec<Vec<CellValue>>,
}

impl SpillBlock {
    pub fn new(rows: Vec<Vec<CellValue>>) -> Self {
        Self { rows }
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .unwrap_or(&EMPTY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcState {
    Done,
    Calculating,
    Pending,
}

/// A live oracle session. Holds one in-flight query at a time: the result is
/// read back from the anchor the query was submitted to.
#[allow(async_fn_in_trait)]
pub trait OracleSession {
    async fn submit(&mut self, anchor: CellRef, query: &OracleQuery) -> Result<()>;

    async fn calculation_state(&mut self) -> Result<CalcState>;

    async fn read_spill(&mut self, anchor: CellRef) -> Result<SpillBlock>;

    /// Clears the anchor so the next query cannot observe stale output.
    async fn clear(&mut self, _anchor: CellRef) -> Result<()> {
        Ok(())
    }
}

/// Acquires and releases per-unit sessions for the orchestrator.
#[allow(async_fn_in_trait)]
pub trait SessionProvider {
    type Session: OracleSession;

    async fn open(&self, unit: &UnitSpec) -> Result<Self::Session>;

    async fn close(&self, session: Self::Session) -> Result<()>;
}
