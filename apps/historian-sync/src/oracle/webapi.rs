use super::query::OracleQuery;
use super::session::{CalcState, CellRef, CellValue, OracleSession, SessionProvider, SpillBlock};
use crate::config::Config;
use crate::error::ConfigError;
use crate::types::UnitSpec;
use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

const PENDING_CELL: &str = "#GETTING_DATA";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct BasicAuth {
    username: String,
    password: Option<String>,
}

/// One interpolated-stream call, detached from the session so it can run on its own task.
#[derive(Debug, Clone, PartialEq)]
struct StreamCall {
    point_path: String,
    start: String,
    end: String,
    interval: String,
}

impl StreamCall {
    fn from_query(query: &OracleQuery) -> Self {
        Self {
            point_path: point_path(&query.server, query.tag.as_str()),
            start: to_webapi_time(query.range.start.as_str()),
            end: to_webapi_time(query.range.end.as_str()),
            interval: interval_param(query.step.as_str()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PointEnvelope {
    #[serde(rename = "WebId")]
    web_id: Option<String>,
    #[serde(rename = "Items", default)]
    items: Vec<PointEnvelope>,
}

impl PointEnvelope {
    fn into_web_id(self) -> Option<String> {
        self.web_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.items.into_iter().find_map(PointEnvelope::into_web_id))
    }
}

#[derive(Debug, Deserialize)]
struct StreamItems {
    #[serde(rename = "Items", default)]
    items: Vec<StreamItem>,
}

#[derive(Debug, Deserialize)]
struct StreamItem {
    #[serde(rename = "Timestamp")]
    timestamp: Option<String>,
    #[serde(rename = "Value", default)]
    value: JsonValue,
}

/// `-4h` becomes `*-4h`; absolute times and `*` pass through.
pub fn to_webapi_time(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('-') {
        format!("*{expr}")
    } else if expr.is_empty() {
        "*".to_string()
    } else {
        expr.to_string()
    }
}

/// Sampling interval without the sign: `-0.1h` becomes `0.1h`.
pub fn interval_param(step: &str) -> String {
    step.trim().replace('-', "")
}

/// `\\SERVER\tag` as expected by the points lookup.
pub fn point_path(server: &str, tag: &str) -> String {
    if server.is_empty() {
        tag.to_string()
    } else {
        format!("{server}\\{tag}")
    }
}

/// Error cell the web API equivalent of an HTTP status renders as.
fn status_token(status: StatusCode) -> Option<&'static str> {
    match status {
        StatusCode::NOT_FOUND => Some("#N/A"),
        StatusCode::BAD_REQUEST => Some("#VALUE!"),
        _ => None,
    }
}

fn value_cell(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Empty,
        JsonValue::Number(number) => number
            .as_f64()
            .map(CellValue::Number)
            .unwrap_or(CellValue::Empty),
        JsonValue::String(text) => CellValue::text(text.as_str()),
        JsonValue::Bool(flag) => CellValue::Number(if *flag { 1.0 } else { 0.0 }),
        // Digital states and system errors arrive as {"Name": "Bad Input", ...}.
        JsonValue::Object(map) => map
            .get("Name")
            .and_then(JsonValue::as_str)
            .map(|name| CellValue::text(name))
            .unwrap_or(CellValue::Empty),
        JsonValue::Array(_) => CellValue::Empty,
    }
}

fn items_to_spill(items: Vec<StreamItem>) -> SpillBlock {
    SpillBlock::new(
        items
            .into_iter()
            .filter_map(|item| {
                let timestamp = item.timestamp.filter(|ts| !ts.trim().is_empty())?;
                Some(vec![CellValue::text(timestamp), value_cell(&item.value)])
            })
            .collect(),
    )
}

fn stream_url(base: &Url, web_id: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("web API base {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(["streams", web_id, "interpolated"]);
    Ok(url)
}

fn points_url(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("web API base {base} cannot carry a path"))?
        .pop_if_empty()
        .push("points");
    Ok(url)
}

fn authorize(
    request: reqwest::RequestBuilder,
    auth: Option<&BasicAuth>,
) -> reqwest::RequestBuilder {
    match auth {
        Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
        None => request,
    }
}

/// Runs the point lookup and the interpolated read. HTTP statuses the oracle
/// would show as error cells come back as a one-cell spill.
async fn run_stream_call(
    http: reqwest::Client,
    base: Url,
    auth: Option<BasicAuth>,
    call: StreamCall,
) -> Result<SpillBlock> {
    let lookup = points_url(&base)?;
    let resp = authorize(http.get(lookup), auth.as_ref())
        .query(&[("path", call.point_path.as_str())])
        .send()
        .await
        .with_context(|| format!("point lookup request failed for {}", call.point_path))?;
    if let Some(token) = status_token(resp.status()) {
        return Ok(SpillBlock::new(vec![vec![CellValue::Error(token.to_string())]]));
    }
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("point lookup returned {status}: {body}");
    }
    let envelope: PointEnvelope = resp
        .json()
        .await
        .with_context(|| format!("invalid point lookup body for {}", call.point_path))?;
    let Some(web_id) = envelope.into_web_id() else {
        return Ok(SpillBlock::new(vec![vec![CellValue::Error("#N/A".to_string())]]));
    };

    let url = stream_url(&base, &web_id)?;
    let resp = authorize(http.get(url), auth.as_ref())
        .query(&[
            ("startTime", call.start.as_str()),
            ("endTime", call.end.as_str()),
            ("interval", call.interval.as_str()),
        ])
        .send()
        .await
        .with_context(|| format!("interpolated read failed for {}", call.point_path))?;
    if let Some(token) = status_token(resp.status()) {
        return Ok(SpillBlock::new(vec![vec![CellValue::Error(token.to_string())]]));
    }
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("interpolated read returned {status}: {body}");
    }
    let items: StreamItems = resp
        .json()
        .await
        .with_context(|| format!("invalid interpolated body for {}", call.point_path))?;
    Ok(items_to_spill(items.items))
}

/// Oracle session backed by the PI Web API. A submitted query runs on its own
/// task; the session reports `Calculating` until that task finishes.
#[derive(Debug)]
pub struct WebApiSession {
    http: reqwest::Client,
    base: Url,
    auth: Option<BasicAuth>,
    in_flight: Option<JoinHandle<Result<SpillBlock>>>,
    settled: Option<SpillBlock>,
}

impl WebApiSession {
    fn abort_in_flight(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

impl OracleSession for WebApiSession {
    async fn submit(&mut self, _anchor: CellRef, query: &OracleQuery) -> Result<()> {
        self.abort_in_flight();
        self.settled = None;
        let call = StreamCall::from_query(query);
        tracing::debug!(
            path = %call.point_path,
            start = %call.start,
            end = %call.end,
            interval = %call.interval,
            "web API query"
        );
        self.in_flight = Some(tokio::spawn(run_stream_call(
            self.http.clone(),
            self.base.clone(),
            self.auth.clone(),
            call,
        )));
        Ok(())
    }

    async fn calculation_state(&mut self) -> Result<CalcState> {
        match self.in_flight.take() {
            Some(handle) if handle.is_finished() => {
                let block = handle.await.context("web API task failed")??;
                self.settled = Some(block);
                Ok(CalcState::Done)
            }
            Some(handle) => {
                self.in_flight = Some(handle);
                Ok(CalcState::Calculating)
            }
            None if self.settled.is_some() => Ok(CalcState::Done),
            None => Ok(CalcState::Pending),
        }
    }

    async fn read_spill(&mut self, _anchor: CellRef) -> Result<SpillBlock> {
        Ok(match &self.settled {
            Some(block) => block.clone(),
            None => SpillBlock::new(vec![vec![CellValue::text(PENDING_CELL)]]),
        })
    }

    async fn clear(&mut self, _anchor: CellRef) -> Result<()> {
        self.abort_in_flight();
        self.settled = None;
        Ok(())
    }
}

impl Drop for WebApiSession {
    fn drop(&mut self) {
        self.abort_in_flight();
    }
}

/// Hands out web API sessions sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct WebApiProvider {
    http: reqwest::Client,
    base: Url,
    auth: Option<BasicAuth>,
}

impl WebApiProvider {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        insecure_tls: bool,
    ) -> Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid web API url {base_url}"))?;
        if insecure_tls {
            tracing::warn!(url = %base, "TLS certificate verification disabled for web API");
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()
            .context("failed to build web API client")?;
        Ok(Self {
            http,
            base,
            auth: username
                .filter(|name| !name.is_empty())
                .map(|username| BasicAuth { username, password }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config.webapi_url.as_deref().ok_or_else(|| {
            ConfigError::invalid("HISTSYNC_WEBAPI_URL", "required to reach the historian")
        })?;
        Self::new(
            url,
            config.webapi_username.clone(),
            config.webapi_password.clone(),
            config.webapi_insecure_tls,
        )
    }

    async fn health_check(&self) -> Result<()> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("web API base {} cannot carry a path", self.base))?
            .pop_if_empty()
            .push("system");
        let resp = authorize(self.http.get(url), self.auth.as_ref())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("web API unreachable at {}", self.base))?;
        if !resp.status().is_success() {
            anyhow::bail!("web API health check returned {}", resp.status());
        }
        Ok(())
    }
}

impl SessionProvider for WebApiProvider {
    type Session = WebApiSession;

    async fn open(&self, unit: &UnitSpec) -> Result<WebApiSession> {
        self.health_check().await?;
        tracing::debug!(unit = %unit.unit, url = %self.base, "web API session opened");
        Ok(WebApiSession {
            http: self.http.clone(),
            base: self.base.clone(),
            auth: self.auth.clone(),
            in_flight: None,
            settled: None,
        })
    }

    async fn close(&self, mut session: WebApiSession) -> Result<()> {
        session.abort_in_flight();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::client::{interpret_spill, RawResponse, RawTable};
    use crate::test_support::request_for;
    use serde_json::json;

    #[test]
    fn relative_times_gain_a_star() {
        assert_eq!(to_webapi_time("-4h"), "*-4h");
        assert_eq!(to_webapi_time("*"), "*");
        assert_eq!(to_webapi_time("2025-03-01 00:00"), "2025-03-01 00:00");
        assert_eq!(interval_param("-0.1h"), "0.1h");
    }

    #[test]
    fn stream_call_uses_the_normalized_server() {
        let query = OracleQuery::from_request(&request_for("PCFS.K3101.PV"), "PLANT-PI01");
        let call = StreamCall::from_query(&query);
        assert_eq!(call.point_path, r"\\PLANT-PI01\PCFS.K3101.PV");
        assert_eq!(call.start, "*-1d");
        assert_eq!(call.end, "*");
        assert_eq!(call.interval, "0.1h");
    }

    #[test]
    fn urls_keep_the_base_path() {
        let base = Url::parse("https://pi.example.local/piwebapi/").unwrap();
        assert_eq!(
            points_url(&base).unwrap().as_str(),
            "https://pi.example.local/piwebapi/points"
        );
        assert_eq!(
            stream_url(&base, "F1DP/abc").unwrap().as_str(),
            "https://pi.example.local/piwebapi/streams/F1DP%2Fabc/interpolated"
        );
    }

    #[test]
    fn web_id_falls_back_to_items() {
        let direct: PointEnvelope = serde_json::from_value(json!({"WebId": "W1"})).unwrap();
        assert_eq!(direct.into_web_id().as_deref(), Some("W1"));
        let listed: PointEnvelope =
            serde_json::from_value(json!({"Items": [{"WebId": "W2"}]})).unwrap();
        assert_eq!(listed.into_web_id().as_deref(), Some("W2"));
        let none: PointEnvelope = serde_json::from_value(json!({"Items": []})).unwrap();
        assert_eq!(none.into_web_id(), None);
    }

    #[test]
    fn stream_items_become_a_two_column_spill() {
        let items: StreamItems = serde_json::from_value(json!({
            "Items": [
                {"Timestamp": "2025-03-01T00:00:00Z", "Value": 12.5},
                {"Timestamp": "2025-03-01T00:06:00Z", "Value": {"Name": "Bad Input", "Value": 307}},
                {"Timestamp": null, "Value": 1.0},
            ]
        }))
        .unwrap();
        let block = items_to_spill(items.items);
        assert_eq!(block.rows.len(), 2);
        assert_eq!(block.cell(0, 1), &CellValue::Number(12.5));
        assert_eq!(block.cell(1, 1), &CellValue::text("Bad Input"));
        match interpret_spill(&block) {
            RawResponse::Success(RawTable::Long { rows }) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn http_statuses_map_to_error_cells() {
        assert_eq!(status_token(StatusCode::NOT_FOUND), Some("#N/A"));
        assert_eq!(status_token(StatusCode::BAD_REQUEST), Some("#VALUE!"));
        assert_eq!(status_token(StatusCode::INTERNAL_SERVER_ERROR), None);
    }

    #[tokio::test]
    async fn unsubmitted_session_reads_pending() {
        let provider =
            WebApiProvider::new("https://pi.example.local/piwebapi", None, None, false).unwrap();
        let mut session = WebApiSession {
            http: provider.http.clone(),
            base: provider.base.clone(),
            auth: None,
            in_flight: None,
            settled: None,
        };
        assert_eq!(session.calculation_state().await.unwrap(), CalcState::Pending);
        let block = session.read_spill(CellRef::default()).await.unwrap();
        assert!(matches!(interpret_spill(&block), RawResponse::Pending));
    }
}
