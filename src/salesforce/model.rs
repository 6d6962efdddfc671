use serde::Deserialize;
use serde_json::Value;

/// OAuth2 password-grant token response. `instance_url` points at the
/// regional host the org actually lives on and takes precedence over the
/// configured login domain.
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub instance_url: Option<String>,
}

/// One page of a SOQL query result.
#[derive(Deserialize, Debug)]
pub struct QueryResponse {
    #[serde(rename = "totalSize", default)]
    pub total_size: i64,
    pub done: bool,
    #[serde(rename = "nextRecordsUrl", default)]
    pub next_records_url: Option<String>,
    #[serde(default)]
    pub records: Vec<Value>,
}
