use crate::types::{FetchRequest, StepExpr, Tag, TimeRange};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    ValuesOnly,
    WithTimestamps,
}

impl QueryMode {
    fn flag(self) -> u8 {
        match self {
            Self::ValuesOnly => 0,
            Self::WithTimestamps => 1,
        }
    }
}

/// The request tuple the oracle evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleQuery {
    pub tag: Tag,
    pub range: TimeRange,
    pub step: StepExpr,
    pub mode: QueryMode,
    pub server: String,
}

impl OracleQuery {
    pub fn from_request(request: &FetchRequest, server: &str) -> Self {
        Self {
            tag: request.tag.clone(),
            range: request.range.clone(),
            step: request.step.clone(),
            mode: QueryMode::WithTimestamps,
            server: normalize_server(server),
        }
    }

    /// Spreadsheet form: `=PISampDat("tag","-1d","*","-0.1h",1,"\\server")`.
    pub fn formula(&self) -> String {
        format!(
            "=PISampDat({},{},{},{},{},{})",
            quote(self.tag.as_str()),
            quote(self.range.start.as_str()),
            quote(self.range.end.as_str()),
            quote(self.step.as_str()),
            self.mode.flag(),
            quote(&self.server),
        )
    }
}

/// `PLANT-PI01`, `\PLANT-PI01` and `\\PLANT-PI01` all mean the same server.
pub fn normalize_server(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('\\');
    if name.is_empty() {
        String::new()
    } else {
        format!("\\\\{name}")
    }
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}
