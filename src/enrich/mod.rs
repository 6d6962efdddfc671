//! Secondary enrichment against the Desktop inventory API: one CTO
//! port-position lookup per row, appending connection status and timing
//! columns. Lookups are strictly sequential — the upstream publishes no
//! rate limit, so the safe default is one in-flight request.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::config;
use crate::model::{Cell, EnrichSummary, Frame};

pub mod model;

use model::{LookupReply, PortPosition};

/// Columns the enrichment appends. They must be part of the job's expected
/// column list so the frame shape stays invariant.
pub const STATUS_COL: &str = "status_cliente_api";
pub const START_COL: &str = "ultima_conexao_inicio";
pub const STOP_COL: &str = "ultima_conexao_fim";
pub const ELAPSED_COL: &str = "tempo_conectado";

/// Row-level status labels, stored verbatim in the warehouse.
pub const STATUS_INSUFFICIENT: &str = "Dados insuficientes";
pub const STATUS_INVALID_PORT: &str = "Porta inválida";
pub const STATUS_CTO_NOT_FOUND: &str = "CTO não encontrada";
pub const STATUS_PORT_NOT_FOUND: &str = "Porta não encontrada";
pub const STATUS_UNKNOWN: &str = "Status não informado";
pub const STATUS_AUTH_ERROR: &str = "Erro de autenticação";
pub const STATUS_CONNECTED: &str = "Conectado";

const API_DATETIME_FMT: &str = "%d/%m/%Y - %H:%M:%S";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("desktop api token exchange failed ({status}): {body}")]
    Token { status: StatusCode, body: String },
    #[error("desktop api http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Which frame columns carry the lookup key for a job.
#[derive(Debug, Clone)]
pub struct EnrichSpec {
    /// CTO group/prefix column (e.g. `sigla_cto`).
    pub group_col: String,
    /// CTO box number column (e.g. `caixa_cto`).
    pub box_col: String,
    /// Port number column (e.g. `porta_cto`).
    pub port_col: String,
}

impl Default for EnrichSpec {
    fn default() -> Self {
        Self {
            group_col: "sigla_cto".into(),
            box_col: "caixa_cto".into(),
            port_col: "porta_cto".into(),
        }
    }
}

/// Seam between the row loop and the HTTP client so tests can count and
/// script lookups.
#[async_trait]
pub trait PositionLookup: Send {
    async fn positions(&mut self, box_code: &str, group: &str) -> Result<LookupReply, EnrichError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Desktop API client with OAuth2 client-credentials auth. The bearer token
/// lives only for the duration of one job run.
pub struct DesktopClient {
    http: Client,
    oauth_url: String,
    client_id: String,
    client_secret: String,
    api_base: String,
    token: Option<String>,
}

impl fmt::Debug for DesktopClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesktopClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl DesktopClient {
    pub fn new(http: Client, cfg: &config::Desktop) -> Self {
        Self {
            http,
            oauth_url: cfg.oauth_url.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Exchange client credentials for a bearer token, replacing any token
    /// held so far.
    pub async fn refresh_token(&mut self) -> Result<(), EnrichError> {
        info!("obtaining desktop api oauth token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let res = self
            .http
            .post(&self.oauth_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(EnrichError::Token { status, body });
        }
        let token: TokenResponse = res.json().await?;
        match token.access_token.filter(|t| !t.trim().is_empty()) {
            Some(t) => {
                self.token = Some(t.trim().to_string());
                Ok(())
            }
            None => Err(EnrichError::Token {
                status,
                body: "empty access_token in response".into(),
            }),
        }
    }

    fn positions_url(&self, box_code: &str, group: &str) -> String {
        format!(
            "{}/resource-inventory/v1/ctos/{}/positions?group={}",
            self.api_base, box_code, group
        )
    }

    async fn get_positions(&self, url: &str) -> Result<reqwest::Response, EnrichError> {
        let mut req = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl PositionLookup for DesktopClient {
    async fn positions(&mut self, box_code: &str, group: &str) -> Result<LookupReply, EnrichError> {
        if self.token.is_none() {
            self.refresh_token().await?;
        }
        let url = self.positions_url(box_code, group);

        let mut res = self.get_positions(&url).await?;

        if res.status() == StatusCode::UNAUTHORIZED {
            // Expired token: refresh exactly once and retry the same
            // request exactly once.
            warn!(cto = %box_code, group = %group, "401 from desktop api; refreshing token and retrying once");
            self.refresh_token().await?;
            res = self.get_positions(&url).await?;
        }

        let status = res.status();
        match status {
            StatusCode::NOT_FOUND => Ok(LookupReply::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = res.text().await.unwrap_or_default();
                warn!(%status, cto = %box_code, group = %group, body = %truncate(&body, 600), "auth error from desktop api");
                Ok(LookupReply::AuthDenied { status })
            }
            s if s.is_success() => {
                let body = res.text().await.unwrap_or_default();
                match serde_json::from_str::<Vec<PortPosition>>(&body) {
                    Ok(list) => Ok(LookupReply::Positions(list)),
                    Err(err) => {
                        warn!(?err, cto = %box_code, group = %group, body = %truncate(&body, 500), "undecodable positions payload");
                        Ok(LookupReply::NotFound)
                    }
                }
            }
            _ => {
                let body = res.text().await.unwrap_or_default();
                warn!(%status, cto = %box_code, group = %group, body = %truncate(&body, 500), "unexpected status from desktop api");
                Ok(LookupReply::NotFound)
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn parse_api_datetime(value: Option<&str>) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value?.trim(), API_DATETIME_FMT).ok()
}

/// `now - start` decomposed into whole days/hours/minutes.
pub fn format_elapsed(now: NaiveDateTime, start: NaiveDateTime) -> String {
    let secs = (now - start).num_seconds().max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

/// The per-row enrichment decision, separated from the frame walk so the
/// short-circuit and matching rules are testable without any I/O.
fn row_key(frame: &Frame, row: usize, spec: &EnrichSpec) -> Result<(String, String, i64), &'static str> {
    let group = frame.get(row, &spec.group_col).cloned().unwrap_or(Cell::Null);
    let box_code = frame.get(row, &spec.box_col).cloned().unwrap_or(Cell::Null);
    let port = frame.get(row, &spec.port_col).cloned().unwrap_or(Cell::Null);

    if group.is_blank() || box_code.is_blank() || port.is_blank() {
        return Err(STATUS_INSUFFICIENT);
    }
    // Ports arrive as "12", "12.0" or a JSON number; anything that does not
    // coerce is an invalid key, not a lookup miss.
    let port_num = match port.as_number() {
        Some(n) => n as i64,
        None => return Err(STATUS_INVALID_PORT),
    };
    let group = cell_string(&group);
    let box_code = cell_string(&box_code);
    Ok((group, box_code, port_num))
}

fn cell_string(cell: &Cell) -> String {
    match cell {
        Cell::Text(s) => s.trim().to_string(),
        Cell::Number(n) => {
            if n.fract() == 0.0 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        Cell::Bool(b) => b.to_string(),
        Cell::Null => String::new(),
    }
}

/// Enrich every row of `frame` in place, filling the four enrichment
/// columns. Rows with incomplete keys never trigger a network call. All
/// row-level failures degrade to a status label and a summary count.
pub async fn enrich_frame(
    frame: &mut Frame,
    api: &mut dyn PositionLookup,
    spec: &EnrichSpec,
    now: NaiveDateTime,
) -> EnrichSummary {
    // Frame::set is a no-op on unknown columns, so a frame whose expected
    // schema lacks the output columns would drop every result on the floor.
    if frame.column_index(STATUS_COL).is_none() {
        warn!(
            column = STATUS_COL,
            "enrichment requested but the frame has no output columns; skipping"
        );
        return EnrichSummary::default();
    }

    info!(rows = frame.len(), "enriching rows via desktop api cto positions");
    let mut summary = EnrichSummary::default();

    for row in 0..frame.len() {
        let mut status = STATUS_INSUFFICIENT.to_string();
        let mut start: Option<NaiveDateTime> = None;
        let mut stop: Option<NaiveDateTime> = None;
        let mut elapsed: Option<String> = None;

        match row_key(frame, row, spec) {
            Err(label) => {
                status = label.to_string();
                if label == STATUS_INVALID_PORT {
                    summary.invalid_port += 1;
                } else {
                    summary.skipped_incomplete += 1;
                }
            }
            Ok((group, box_code, port_num)) => {
                summary.looked_up += 1;
                match api.positions(&box_code, &group).await {
                    Ok(LookupReply::Positions(list)) => {
                        status = STATUS_PORT_NOT_FOUND.to_string();
                        let matched = list
                            .iter()
                            .find(|p| p.port_number == Some(port_num));
                        match matched {
                            Some(position) => {
                                status = position
                                    .status
                                    .clone()
                                    .unwrap_or_else(|| STATUS_UNKNOWN.to_string());
                                start = parse_api_datetime(position.last_connection_start.as_deref());
                                stop = parse_api_datetime(position.last_connection_stop.as_deref());
                                if status == STATUS_CONNECTED {
                                    summary.connected += 1;
                                    if let Some(s) = start {
                                        elapsed = Some(format_elapsed(now, s));
                                    }
                                }
                            }
                            None => summary.port_not_found += 1,
                        }
                    }
                    Ok(LookupReply::NotFound) => {
                        status = STATUS_CTO_NOT_FOUND.to_string();
                        summary.upstream_not_found += 1;
                    }
                    Ok(LookupReply::AuthDenied { status: s }) => {
                        status = STATUS_AUTH_ERROR.to_string();
                        summary.auth_errors += 1;
                        warn!(status = %s, row, "row-level auth error during enrichment");
                    }
                    Err(err) => {
                        // Transport failure on one row: keep going, the
                        // rest of the batch is still loadable.
                        status = STATUS_CTO_NOT_FOUND.to_string();
                        summary.transport_errors += 1;
                        warn!(?err, row, "lookup transport failure; row kept without enrichment");
                    }
                }
            }
        }

        frame.set(row, STATUS_COL, Cell::Text(status));
        frame.set(
            row,
            START_COL,
            start.map_or(Cell::Null, |d| {
                Cell::Text(d.format("%Y-%m-%d %H:%M:%S").to_string())
            }),
        );
        frame.set(
            row,
            STOP_COL,
            stop.map_or(Cell::Null, |d| {
                Cell::Text(d.format("%Y-%m-%d %H:%M:%S").to_string())
            }),
        );
        frame.set(row, ELAPSED_COL, elapsed.map_or(Cell::Null, Cell::Text));
    }

    info!(
        looked_up = summary.looked_up,
        skipped = summary.skipped_incomplete,
        invalid_port = summary.invalid_port,
        cto_not_found = summary.upstream_not_found,
        port_not_found = summary.port_not_found,
        auth_errors = summary.auth_errors,
        transport_errors = summary.transport_errors,
        connected = summary.connected,
        "enrichment finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_api_datetime_format() {
        let dt = parse_api_datetime(Some("12/08/2025 - 10:30:05")).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2025-08-12 10:30:05");
        assert!(parse_api_datetime(Some("2025-08-12 10:30:05")).is_none());
        assert!(parse_api_datetime(None).is_none());
    }

    #[test]
    fn elapsed_decomposes_days_hours_minutes() {
        let start = NaiveDate::from_ymd_opt(2025, 8, 10)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 8, 12)
            .unwrap()
            .and_hms_opt(10, 31, 40)
            .unwrap();
        assert_eq!(format_elapsed(now, start), "2d 2h 31m");
    }

    #[test]
    fn elapsed_never_negative() {
        let start = NaiveDate::from_ymd_opt(2025, 8, 12)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let now = NaiveDate::from_ymd_opt(2025, 8, 12)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(format_elapsed(now, start), "0d 0h 0m");
    }

    #[test]
    fn row_key_rules() {
        let spec = EnrichSpec::default();
        let mut frame = Frame::new(vec![
            "sigla_cto".into(),
            "caixa_cto".into(),
            "porta_cto".into(),
        ]);
        frame.push_row(vec![Cell::from("CPS"), Cell::from("123"), Cell::from("4.0")]);
        frame.push_row(vec![Cell::from("CPS"), Cell::Null, Cell::from("4")]);
        frame.push_row(vec![Cell::from("CPS"), Cell::from("123"), Cell::from("fibra")]);

        assert_eq!(
            row_key(&frame, 0, &spec),
            Ok(("CPS".to_string(), "123".to_string(), 4))
        );
        assert_eq!(row_key(&frame, 1, &spec), Err(STATUS_INSUFFICIENT));
        assert_eq!(row_key(&frame, 2, &spec), Err(STATUS_INVALID_PORT));
    }

    struct UnreachableLookup;

    #[async_trait]
    impl PositionLookup for UnreachableLookup {
        async fn positions(
            &mut self,
            _box_code: &str,
            _group: &str,
        ) -> Result<LookupReply, EnrichError> {
            panic!("no lookup may happen for a frame without output columns");
        }
    }

    #[tokio::test]
    async fn frames_without_output_columns_are_skipped_wholesale() {
        let mut frame = Frame::new(vec![
            "sigla_cto".into(),
            "caixa_cto".into(),
            "porta_cto".into(),
        ]);
        frame.push_row(vec![Cell::from("CPS"), Cell::from("123"), Cell::from("4")]);

        let now = NaiveDate::from_ymd_opt(2025, 8, 12)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut api = UnreachableLookup;
        let summary = enrich_frame(&mut frame, &mut api, &EnrichSpec::default(), now).await;

        assert_eq!(summary, EnrichSummary::default());
        assert_eq!(frame.get(0, "sigla_cto"), Some(&Cell::from("CPS")));
    }
}
