use super::query::OracleQuery;
use super::session::{CalcState, CellRef, CellValue, OracleSession, SpillBlock};
use crate::config::Config;
use crate::error::{OracleFailure, OracleFailureKind};
use crate::types::FetchRequest;
use std::time::Duration;

/// Rows inspected for an early, pre-settle result.
const EARLY_VALUE_ROWS: usize = 10;

const PENDING_PREFIXES: [&str; 4] = ["#GETTING_DATA", "#BUSY", "Calculating", "Pending"];

const NOT_FOUND_PREFIXES: [&str; 4] = ["#N/A", "No Good Data", "Tag not found", "Point not found"];

const INVALID_TAG_PREFIXES: [&str; 6] = [
    "#NAME?",
    "#REF!",
    "#VALUE!",
    "#NUM!",
    "Bad Input",
    "The time is invalid",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub time: CellValue,
    pub value: CellValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub time: CellValue,
    pub values: Vec<CellValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawTable {
    /// Two columns, time and value, for a single tag.
    Long { rows: Vec<RawRow> },
    /// One value column per tag.
    Wide { tags: Vec<String>, rows: Vec<WideRow> },
}

impl RawTable {
    pub fn row_count(&self) -> usize {
        match self {
            Self::Long { rows } => rows.len(),
            Self::Wide { rows, .. } => rows.len(),
        }
    }

    /// No rows, or a lone timestamp without a value.
    pub fn is_empty_result(&self) -> bool {
        match self {
            Self::Long { rows } => match rows.as_slice() {
                [] => true,
                [only] => only.value.is_empty(),
                _ => false,
            },
            Self::Wide { rows, .. } => rows
                .iter()
                .all(|row| row.values.iter().all(CellValue::is_empty)),
        }
    }

    fn has_early_value(&self) -> bool {
        match self {
            Self::Long { rows } => rows
                .iter()
                .take(EARLY_VALUE_ROWS)
                .any(|row| !row.time.is_empty() && row.value.as_number().is_some()),
            Self::Wide { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Success(RawTable),
    ErrorToken { kind: OracleFailureKind, token: String },
    Pending,
}

pub fn is_pending_token(token: &str) -> bool {
    let token = token.trim();
    PENDING_PREFIXES
        .iter()
        .any(|prefix| starts_with_ignore_case(token, prefix))
}

/// Maps an in-band error token to its failure class. `None` for anything that
/// is not a recognized sentinel.
pub fn classify_token(token: &str) -> Option<OracleFailureKind> {
    let token = token.trim();
    if NOT_FOUND_PREFIXES
        .iter()
        .any(|prefix| starts_with_ignore_case(token, prefix))
    {
        return Some(OracleFailureKind::NotFound);
    }
    if INVALID_TAG_PREFIXES
        .iter()
        .any(|prefix| starts_with_ignore_case(token, prefix))
    {
        return Some(OracleFailureKind::InvalidTag);
    }
    None
}

fn starts_with_ignore_case(token: &str, prefix: &str) -> bool {
    token
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

/// Reads a spill from the anchor down to the first fully empty row.
pub fn interpret_spill(spill: &SpillBlock) -> RawResponse {
    let head = spill.cell(0, 0);
    if let Some(token) = head.token() {
        if is_pending_token(token) {
            return RawResponse::Pending;
        }
        if let Some(kind) = classify_token(token) {
            return RawResponse::ErrorToken {
                kind,
                token: token.to_string(),
            };
        }
    }
    if let CellValue::Error(token) = head {
        return RawResponse::ErrorToken {
            kind: OracleFailureKind::InvalidTag,
            token: token.trim().to_string(),
        };
    }

    let rows = (0..spill.rows.len())
        .map(|idx| RawRow {
            time: spill.cell(idx, 0).clone(),
            value: spill.cell(idx, 1).clone(),
        })
        .take_while(|row| !(row.time.is_empty() && row.value.is_empty()))
        .collect();
    RawResponse::Success(RawTable::Long { rows })
}

/// Drives one query at a time through a borrowed session.
#[derive(Debug, Clone)]
pub struct OracleClient {
    server: String,
    anchor: CellRef,
    timeout: Duration,
    poll_interval: Duration,
    settle_cycles: u32,
}

impl OracleClient {
    pub fn new(
        server: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
        settle_cycles: u32,
    ) -> Self {
        Self {
            server: server.into(),
            anchor: CellRef::default(),
            timeout,
            poll_interval,
            settle_cycles: settle_cycles.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pi_server.clone(),
            config.fetch_timeout(),
            config.poll_interval(),
            config.settle_cycles,
        )
    }

    pub async fn fetch<S: OracleSession>(
        &self,
        session: &mut S,
        request: &FetchRequest,
    ) -> Result<RawTable, OracleFailure> {
        let query = OracleQuery::from_request(request, &self.server);
        match tokio::time::timeout(self.timeout, self.evaluate(session, &query)).await {
            Ok(result) => result,
            Err(_) => Err(OracleFailure::new(
                request.tag.as_str(),
                OracleFailureKind::Timeout,
                format!("no settled result within {}s", self.timeout.as_secs_f64()),
            )),
        }
    }

    async fn evaluate<S: OracleSession>(
        &self,
        session: &mut S,
        query: &OracleQuery,
    ) -> Result<RawTable, OracleFailure> {
        let tag = query.tag.as_str();
        let session_failure = |stage: &str, err: anyhow::Error| {
            OracleFailure::new(tag, OracleFailureKind::Session, format!("{stage}: {err:#}"))
        };

        session
            .clear(self.anchor)
            .await
            .map_err(|err| session_failure("clear", err))?;
        session
            .submit(self.anchor, query)
            .await
            .map_err(|err| session_failure("submit", err))?;
        tracing::debug!(
            tag,
            anchor = %self.anchor,
            formula = %query.formula(),
            "submitted oracle query"
        );

        let mut polls: u32 = 0;
        let mut done_streak: u32 = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            polls += 1;

            let state = session
                .calculation_state()
                .await
                .map_err(|err| session_failure("state", err))?;
            done_streak = if state == CalcState::Done { done_streak + 1 } else { 0 };
            let spill = session
                .read_spill(self.anchor)
                .await
                .map_err(|err| session_failure("read", err))?;
            let response = interpret_spill(&spill);
            tracing::debug!(tag, polls, ?state, done_streak, "oracle poll");

            match response {
                RawResponse::Success(table) if table.has_early_value() => return Ok(table),
                _ if done_streak < self.settle_cycles => continue,
                RawResponse::Pending => continue,
                RawResponse::ErrorToken { kind, token } => {
                    return Err(OracleFailure::new(tag, kind, token));
                }
                RawResponse::Success(table) if table.is_empty_result() => {
                    return Err(OracleFailure::new(
                        tag,
                        OracleFailureKind::Empty,
                        format!("settled with {} row(s) and no values", table.row_count()),
                    ));
                }
                RawResponse::Success(table) => return Ok(table),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request_for, spill, Scripted, ScriptedSession};

    fn fast_client() -> OracleClient {
        OracleClient::new("SRV", Duration::from_millis(200), Duration::from_millis(2), 2)
    }

    #[test]
    fn sentinel_tokens_are_classified() {
        assert_eq!(classify_token("#N/A"), Some(OracleFailureKind::NotFound));
        assert_eq!(
            classify_token("no good data for this range"),
            Some(OracleFailureKind::NotFound)
        );
        assert_eq!(classify_token("#REF!"), Some(OracleFailureKind::InvalidTag));
        assert_eq!(classify_token("The time is invalid."), Some(OracleFailureKind::InvalidTag));
        assert_eq!(classify_token("12.5"), None);
        assert!(is_pending_token("#GETTING_DATA"));
        assert!(!is_pending_token("#N/A"));
    }

    #[test]
    fn spill_is_read_to_the_first_empty_row() {
        let block = SpillBlock::new(vec![
            vec![CellValue::Number(45_000.0), CellValue::Number(1.0)],
            vec![CellValue::Number(45_000.5), CellValue::Number(2.0)],
            vec![CellValue::Empty, CellValue::Empty],
            vec![CellValue::Number(45_001.0), CellValue::Number(9.0)],
        ]);
        match interpret_spill(&block) {
            RawResponse::Success(RawTable::Long { rows }) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lone_timestamp_is_an_empty_result() {
        let block = SpillBlock::new(vec![vec![CellValue::Number(45_000.0), CellValue::Empty]]);
        match interpret_spill(&block) {
            RawResponse::Success(table) => assert!(table.is_empty_result()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_error_cells_are_invalid_tags() {
        let block = SpillBlock::new(vec![vec![CellValue::Error("#DIV/0!".into())]]);
        assert_eq!(
            interpret_spill(&block),
            RawResponse::ErrorToken {
                kind: OracleFailureKind::InvalidTag,
                token: "#DIV/0!".into()
            }
        );
    }

    #[tokio::test]
    async fn numeric_values_return_before_settling() {
        let mut session = ScriptedSession::new().with(
            "T1",
            Scripted::Early(spill(&[(45_000.0, Some(1.5))])),
        );
        let table = fast_client()
            .fetch(&mut session, &request_for("T1"))
            .await
            .unwrap();
        assert_eq!(table.row_count(), 1);
    }

    #[tokio::test]
    async fn slow_oracle_times_out() {
        let mut session = ScriptedSession::new().with("T1", Scripted::Timeout);
        let err = fast_client()
            .fetch(&mut session, &request_for("T1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OracleFailureKind::Timeout);
        assert_eq!(err.tag, "T1");
    }

    #[tokio::test]
    async fn error_token_surfaces_after_settling() {
        let mut session = ScriptedSession::new().with("T1", Scripted::Token("#N/A".into()));
        let err = fast_client()
            .fetch(&mut session, &request_for("T1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OracleFailureKind::NotFound);
        assert!(session.polls_for("T1") >= 2);
    }

    #[tokio::test]
    async fn settled_without_values_is_empty() {
        let mut session = ScriptedSession::new().with("T1", Scripted::Block(SpillBlock::default()));
        let err = fast_client()
            .fetch(&mut session, &request_for("T1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OracleFailureKind::Empty);
    }

    #[tokio::test]
    async fn submit_failure_is_a_session_failure() {
        let mut session =
            ScriptedSession::new().with("T1", Scripted::SubmitError("disconnected".into()));
        let err = fast_client()
            .fetch(&mut session, &request_for("T1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OracleFailureKind::Session);
        assert!(err.detail.contains("disconnected"));
    }
}
