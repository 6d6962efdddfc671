use reqwest::StatusCode;
use serde::Deserialize;

/// One port/position entry from the CTO positions endpoint.
#[derive(Deserialize, Debug, Clone)]
pub struct PortPosition {
    #[serde(default)]
    pub port_number: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    /// Local-time strings formatted `DD/MM/YYYY - HH:MM:SS`.
    #[serde(default)]
    pub last_connection_start: Option<String>,
    #[serde(default)]
    pub last_connection_stop: Option<String>,
}

/// Outcome of one positions lookup. Absence is a common, valid result and
/// is distinct from an error.
#[derive(Debug, Clone)]
pub enum LookupReply {
    Positions(Vec<PortPosition>),
    /// 404 (or an undecodable body): the CTO does not exist upstream.
    NotFound,
    /// 401/403 after the single token refresh + retry.
    AuthDenied { status: StatusCode },
}
