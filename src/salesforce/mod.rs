//! Salesforce REST client: OAuth2 password-grant auth and the paginated
//! SOQL query executor.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config;
use crate::retry::RetryPolicy;

pub mod model;

use model::{QueryResponse, TokenResponse};

#[derive(Debug, Error)]
pub enum SfError {
    #[error("salesforce auth failed ({status}): {body}")]
    Auth { status: StatusCode, body: String },
    #[error("salesforce query failed ({status}): {body}")]
    Api { status: StatusCode, body: String },
    #[error("salesforce http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid salesforce response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An authenticated Salesforce session for one job run. Sessions are never
/// cached across runs; every job re-authenticates.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub instance_url: String,
}

impl Session {
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Exchange credentials for a bearer token. A non-2xx response surfaces the
/// upstream status code and body verbatim — these messages are what
/// operators diagnose credential and org problems from. No retry here.
pub async fn authenticate(http: &Client, sf: &config::Salesforce) -> Result<Session, SfError> {
    let url = format!("{}/services/oauth2/token", sf.domain.trim_end_matches('/'));
    info!(domain = %sf.domain, "authenticating against salesforce");

    let form = [
        ("grant_type", "password"),
        ("client_id", sf.client_id.as_str()),
        ("client_secret", sf.client_secret.as_str()),
        ("username", sf.username.as_str()),
        ("password", sf.password.as_str()),
    ];

    let res = http.post(&url).form(&form).send().await?;
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        warn!(%status, "salesforce token exchange rejected");
        return Err(SfError::Auth { status, body });
    }

    let token: TokenResponse = serde_json::from_str(&res.text().await?)?;
    // The token endpoint may redirect the org to a different regional host;
    // when it says so, that host wins over the configured domain.
    let instance_url = token
        .instance_url
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| sf.domain.clone())
        .trim_end_matches('/')
        .to_string();

    info!(instance = %instance_url, "salesforce authentication ok");
    Ok(Session {
        access_token: token.access_token,
        instance_url,
    })
}

/// URL of the first page of a query.
pub fn query_url(instance_url: &str, api_version: &str) -> String {
    format!(
        "{}/services/data/v{}/query",
        instance_url.trim_end_matches('/'),
        api_version
    )
}

/// URL of a continuation page from the server-supplied relative path.
pub fn next_page_url(instance_url: &str, next_records_path: &str) -> String {
    format!(
        "{}{}",
        instance_url.trim_end_matches('/'),
        next_records_path
    )
}

/// Abstraction over a paged record stream so the orchestrator can be driven
/// by fakes in tests.
#[async_trait]
pub trait RecordSource: Send {
    /// Pull the next batch of raw records; `None` once the stream is done.
    async fn next_page(&mut self) -> Result<Option<Vec<Value>>, SfError>;
}

enum PageState {
    /// First request still pending; holds the SOQL text.
    Start(String),
    /// Mid-stream; holds the server-supplied relative continuation path.
    Next(String),
    Done,
}

/// Lazy paginated SOQL executor. Finite and not restartable: re-iterating
/// requires building a new executor, which re-issues the first request.
pub struct QueryPages {
    http: Client,
    session: Session,
    api_version: String,
    retry: RetryPolicy,
    state: PageState,
    pages_fetched: usize,
}

impl QueryPages {
    pub fn new(http: Client, session: Session, api_version: &str, soql: &str) -> Self {
        Self::with_retry(http, session, api_version, soql, RetryPolicy::default())
    }

    pub fn with_retry(
        http: Client,
        session: Session,
        api_version: &str,
        soql: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            session,
            api_version: api_version.to_string(),
            retry,
            state: PageState::Start(soql.to_string()),
            pages_fetched: 0,
        }
    }

    /// Issue one page request, retrying timeouts/5xx per the policy. A 4xx
    /// or exhausted retries abort the whole sequence.
    async fn fetch(&self, url: &str, soql: Option<&str>) -> Result<QueryResponse, SfError> {
        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .get(url)
                .header("Authorization", self.session.bearer());
            if let Some(q) = soql {
                req = req.query(&[("q", q)]);
            }

            let outcome = req.send().await;
            match outcome {
                Ok(res) => {
                    let status = res.status();
                    if status.is_success() {
                        let body = res.text().await?;
                        return Ok(serde_json::from_str(&body)?);
                    }
                    let body = res.text().await.unwrap_or_default();
                    if RetryPolicy::is_retryable_status(status)
                        && attempt + 1 < self.retry.max_attempts
                    {
                        let delay = self.retry.backoff(attempt);
                        warn!(%status, attempt, ?delay, "retryable query page failure; backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SfError::Api { status, body });
                }
                Err(err) => {
                    if RetryPolicy::is_retryable_transport(&err)
                        && attempt + 1 < self.retry.max_attempts
                    {
                        let delay = self.retry.backoff(attempt);
                        warn!(?err, attempt, ?delay, "transport failure on query page; backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SfError::Http(err));
                }
            }
        }
    }
}

#[async_trait]
impl RecordSource for QueryPages {
    async fn next_page(&mut self) -> Result<Option<Vec<Value>>, SfError> {
        let page = match &self.state {
            PageState::Done => return Ok(None),
            PageState::Start(soql) => {
                let url = query_url(&self.session.instance_url, &self.api_version);
                self.fetch(&url, Some(&soql.clone())).await?
            }
            PageState::Next(path) => {
                let url = next_page_url(&self.session.instance_url, path);
                self.fetch(&url, None).await?
            }
        };

        self.pages_fetched += 1;
        info!(
            page = self.pages_fetched,
            records = page.records.len(),
            total = page.total_size,
            done = page.done,
            "fetched query page"
        );

        self.state = if page.done {
            PageState::Done
        } else {
            match page.next_records_url {
                Some(path) => PageState::Next(path),
                // Defensive: a not-done page without a cursor cannot be
                // continued; treat the stream as finished.
                None => {
                    warn!("page marked not done but carried no nextRecordsUrl; stopping");
                    PageState::Done
                }
            }
        };

        Ok(Some(page.records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_urls_are_built_from_instance() {
        assert_eq!(
            query_url("https://na1.salesforce.com/", "65.0"),
            "https://na1.salesforce.com/services/data/v65.0/query"
        );
        assert_eq!(
            next_page_url("https://na1.salesforce.com", "/services/data/v65.0/query/01g-2000"),
            "https://na1.salesforce.com/services/data/v65.0/query/01g-2000"
        );
    }

    #[test]
    fn query_response_parses_page_fields() {
        let body = r#"{
            "totalSize": 2,
            "done": false,
            "nextRecordsUrl": "/services/data/v65.0/query/01g-1",
            "records": [
                {"attributes": {"type": "ServiceAppointment"}, "Id": "08p1"},
                {"attributes": {"type": "ServiceAppointment"}, "Id": "08p2"}
            ]
        }"#;
        let page: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(page.total_size, 2);
        assert!(!page.done);
        assert_eq!(
            page.next_records_url.as_deref(),
            Some("/services/data/v65.0/query/01g-1")
        );
        assert_eq!(page.records.len(), 2);
    }

    #[test]
    fn token_response_tolerates_missing_instance_url() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "00D!abc"}"#).unwrap();
        assert_eq!(token.access_token, "00D!abc");
        assert!(token.instance_url.is_none());
    }
}
