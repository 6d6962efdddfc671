//! Configuration loader and validator for the Salesforce→MySQL syncer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Missing or empty required settings: {0}")]
    Missing(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub salesforce: Salesforce,
    pub desktop: Desktop,
    pub warehouse: Warehouse,
    pub jobs: Jobs,
}

/// App-level tuning knobs shared by every job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    /// Rows per insert transaction.
    pub chunk_size: usize,
    /// Per-request HTTP timeout. Result sets and upstream latency can be
    /// large, so this is on the order of minutes.
    pub http_timeout_secs: u64,
    /// Max attempts for a retryable page request.
    pub max_attempts: u32,
    /// Fixed UTC offset applied when rendering timestamps locally.
    pub utc_offset_hours: i32,
}

/// Salesforce OAuth2 password-grant credentials and query API version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Salesforce {
    pub domain: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub api_version: String,
}

/// Desktop inventory API (client-credentials OAuth2) used for row enrichment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Desktop {
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    #[serde(default)]
    pub verify_ssl: bool,
}

/// MySQL warehouse connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warehouse {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Per-job destination tables and extraction windows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Jobs {
    pub tickets: TicketsJob,
    pub appointment_history: AppointmentHistoryJob,
    pub work_order_history: WorkOrderHistoryJob,
    pub hxh_report: HxhReportJob,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketsJob {
    pub table: String,
    /// SOQL datetime literal lower bound for SchedEndTime_Gantt__c.
    pub sched_end_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppointmentHistoryJob {
    pub table: String,
    /// How many days back to re-extract (1 = yesterday + today).
    pub days_back: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkOrderHistoryJob {
    pub table: String,
    /// SOQL datetime literal lower bound for CreatedDate.
    pub created_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HxhReportJob {
    /// Output CSV file path; parent directories are created on demand.
    pub path: String,
    /// SOQL datetime literal lower bound for CreatedDate.
    pub created_from: String,
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance. Every missing or empty required
/// setting is collected and reported in a single error so operators fix the
/// file in one pass; validation always runs before any network call.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let mut missing: Vec<&'static str> = Vec::new();
    let mut require = |name: &'static str, value: &str| {
        if value.trim().is_empty() {
            missing.push(name);
        }
    };

    require("salesforce.domain", &cfg.salesforce.domain);
    require("salesforce.client_id", &cfg.salesforce.client_id);
    require("salesforce.client_secret", &cfg.salesforce.client_secret);
    require("salesforce.username", &cfg.salesforce.username);
    require("salesforce.password", &cfg.salesforce.password);
    require("salesforce.api_version", &cfg.salesforce.api_version);

    require("desktop.oauth_url", &cfg.desktop.oauth_url);
    require("desktop.client_id", &cfg.desktop.client_id);
    require("desktop.client_secret", &cfg.desktop.client_secret);
    require("desktop.api_base", &cfg.desktop.api_base);

    require("warehouse.host", &cfg.warehouse.host);
    require("warehouse.database", &cfg.warehouse.database);
    require("warehouse.user", &cfg.warehouse.user);
    require("warehouse.password", &cfg.warehouse.password);

    require("jobs.tickets.table", &cfg.jobs.tickets.table);
    require("jobs.tickets.sched_end_from", &cfg.jobs.tickets.sched_end_from);
    require(
        "jobs.appointment_history.table",
        &cfg.jobs.appointment_history.table,
    );
    require(
        "jobs.work_order_history.table",
        &cfg.jobs.work_order_history.table,
    );
    require(
        "jobs.work_order_history.created_from",
        &cfg.jobs.work_order_history.created_from,
    );
    require("jobs.hxh_report.path", &cfg.jobs.hxh_report.path);
    require(
        "jobs.hxh_report.created_from",
        &cfg.jobs.hxh_report.created_from,
    );

    if !missing.is_empty() {
        return Err(ConfigError::Missing(missing.join(", ")));
    }

    if cfg.app.chunk_size == 0 {
        return Err(ConfigError::Invalid("app.chunk_size must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.utc_offset_hours.abs() > 14 {
        return Err(ConfigError::Invalid(
            "app.utc_offset_hours must be within -14..=14",
        ));
    }

    Ok(())
}

/// Example YAML exercised by tests; doubles as setup documentation.
pub fn example() -> &'static str {
    r#"app:
  chunk_size: 1000
  http_timeout_secs: 600
  max_attempts: 3
  utc_offset_hours: -3

salesforce:
  domain: "https://example.my.salesforce.com"
  client_id: "SF_CLIENT_ID"
  client_secret: "SF_CLIENT_SECRET"
  username: "reports@example.com"
  password: "SF_PASSWORD_WITH_TOKEN"
  api_version: "65.0"

desktop:
  oauth_url: "https://api.example.net/oauth2/token"
  client_id: "DESKTOP_CLIENT_ID"
  client_secret: "DESKTOP_CLIENT_SECRET"
  api_base: "https://api.example.net"
  verify_ssl: true

warehouse:
  host: "127.0.0.1"
  port: 3306
  database: "db_operacoes"
  user: "etl"
  password: "WAREHOUSE_PASSWORD"

jobs:
  tickets:
    table: "ticket"
    sched_end_from: "2025-11-03T00:00:00.000-03:00"
  appointment_history:
    table: "service_appointment_history"
    days_back: 1
  work_order_history:
    table: "historico_ordem_servico_casos_criticos"
    created_from: "2025-08-11T00:00:00.000-03:00"
  hxh_report:
    path: "reports/relatorio_hxh.csv"
    created_from: "2025-10-31T21:00:00.000-03:00"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.utc_offset_hours, -3);
        assert_eq!(cfg.jobs.tickets.table, "ticket");
    }

    #[test]
    fn missing_settings_are_enumerated() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.salesforce.client_secret = "".into();
        cfg.warehouse.password = "  ".into();
        cfg.jobs.tickets.table = "".into();
        cfg.jobs.hxh_report.path = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Missing(msg) => {
                assert!(msg.contains("salesforce.client_secret"));
                assert!(msg.contains("warehouse.password"));
                assert!(msg.contains("jobs.tickets.table"));
                assert!(msg.contains("jobs.hxh_report.path"));
            }
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn invalid_chunk_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.chunk_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("chunk_size")),
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn invalid_offset() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.utc_offset_hours = 20;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.jobs.appointment_history.days_back, 1);
    }
}
