//! MySQL warehouse loader: schema introspection, truncation, and chunked
//! multi-row inserts/upserts with one committed transaction per chunk.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config;
use crate::model::{Cell, Frame, LoadMode};

pub type Pool = MySqlPool;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("warehouse sql error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("destination table '{0}' has no columns (missing table?)")]
    NoColumns(String),
    #[error("upsert key column '{key}' not present in destination '{table}'")]
    MissingKey { key: &'static str, table: String },
}

/// Accounting for one load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub inserted: usize,
    pub failed_chunks: usize,
}

/// Structured connect options instead of a DSN string, so credentials with
/// URL-reserved characters pass through verbatim.
pub fn connect_options(cfg: &config::Warehouse) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .username(&cfg.user)
        .password(&cfg.password)
        .database(&cfg.database)
}

pub async fn init_pool(cfg: &config::Warehouse) -> Result<Pool, LoadError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options(cfg))
        .await?;
    info!(host = %cfg.host, database = %cfg.database, "connected to warehouse");
    Ok(pool)
}

/// Seam between the orchestrator and MySQL so tests can record load plans.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Live column list of the destination, in declared order.
    async fn columns(&self, table: &str) -> Result<Vec<String>, LoadError>;
    async fn ensure_table(&self, ddl: &str) -> Result<(), LoadError>;
    async fn truncate(&self, table: &str) -> Result<(), LoadError>;
    async fn load(
        &self,
        frame: &Frame,
        table: &str,
        mode: &LoadMode,
        chunk_size: usize,
    ) -> Result<LoadStats, LoadError>;
}

pub struct Warehouse {
    pool: Pool,
}

impl Warehouse {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Destination for Warehouse {
    #[instrument(skip(self))]
    async fn columns(&self, table: &str) -> Result<Vec<String>, LoadError> {
        let cols: Vec<String> = sqlx::query_scalar(
            "SELECT COLUMN_NAME FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if cols.is_empty() {
            return Err(LoadError::NoColumns(table.to_string()));
        }
        Ok(cols)
    }

    #[instrument(skip_all)]
    async fn ensure_table(&self, ddl: &str) -> Result<(), LoadError> {
        sqlx::query(ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Destructive and irreversible; only invoked after extraction has
    /// fully and successfully materialized its result set.
    #[instrument(skip(self))]
    async fn truncate(&self, table: &str) -> Result<(), LoadError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("TRUNCATE TABLE `{table}`"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(table, "destination truncated");
        Ok(())
    }

    #[instrument(skip(self, frame))]
    async fn load(
        &self,
        frame: &Frame,
        table: &str,
        mode: &LoadMode,
        chunk_size: usize,
    ) -> Result<LoadStats, LoadError> {
        let mut stats = LoadStats::default();
        if frame.is_empty() {
            return Ok(stats);
        }
        if let LoadMode::Upsert { key } = mode {
            if !frame.columns().iter().any(|c| c == key) {
                return Err(LoadError::MissingKey {
                    key,
                    table: table.to_string(),
                });
            }
        }

        let columns = frame.columns();
        let mut chunk_no = 0usize;
        for chunk in frame.rows().chunks(chunk_size.max(1)) {
            chunk_no += 1;
            let sql = match mode {
                LoadMode::Truncate => build_insert_sql(table, columns, chunk.len()),
                LoadMode::Upsert { key } => build_upsert_sql(table, columns, key, chunk.len()),
            };
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for cell in row {
                    query = bind_cell(query, cell);
                }
            }

            // One transaction per chunk: a failure mid-load leaves the
            // chunks already committed intact (at-least-once, not
            // atomic-whole-load).
            let outcome = async {
                let mut tx = self.pool.begin().await?;
                query.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok::<(), sqlx::Error>(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    stats.inserted += chunk.len();
                    info!(table, chunk = chunk_no, rows = chunk.len(), "chunk committed");
                }
                Err(err) => {
                    stats.failed_chunks += 1;
                    error!(?err, table, chunk = chunk_no, rows = chunk.len(), "chunk failed; continuing with remaining chunks");
                }
            }
        }

        info!(
            table,
            inserted = stats.inserted,
            failed_chunks = stats.failed_chunks,
            mode = mode.as_str(),
            "load finished"
        );
        Ok(stats)
    }
}

type MySqlQuery<'q> =
    sqlx::query::Query<'q, sqlx::MySql, <sqlx::MySql as sqlx::database::HasArguments<'q>>::Arguments>;

/// Null cells and blank strings both land as SQL NULL; the warehouse
/// treats an empty upstream field and an absent one identically.
fn bind_cell<'q>(query: MySqlQuery<'q>, cell: &'q Cell) -> MySqlQuery<'q> {
    match cell {
        Cell::Null => query.bind(None::<String>),
        Cell::Bool(b) => query.bind(*b),
        Cell::Number(n) => query.bind(*n),
        Cell::Text(s) if s.trim().is_empty() => query.bind(None::<String>),
        Cell::Text(s) => query.bind(s.as_str()),
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholder_rows(columns: usize, rows: usize) -> String {
    let one = format!("({})", vec!["?"; columns].join(", "));
    vec![one; rows].join(", ")
}

/// Multi-row parameterized INSERT; column order matches the frame, which by
/// this point has been projected to the destination's declared order.
pub fn build_insert_sql(table: &str, columns: &[String], rows: usize) -> String {
    format!(
        "INSERT INTO `{table}` ({}) VALUES {}",
        column_list(columns),
        placeholder_rows(columns.len(), rows)
    )
}

/// Multi-row insert-or-update keyed on the upstream record id. Every
/// non-key column is refreshed on conflict.
pub fn build_upsert_sql(table: &str, columns: &[String], key: &str, rows: usize) -> String {
    let updates = columns
        .iter()
        .filter(|c| c.as_str() != key)
        .map(|c| format!("`{c}` = VALUES(`{c}`)"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO `{table}` ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
        column_list(columns),
        placeholder_rows(columns.len(), rows),
        updates
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn insert_sql_shape() {
        let sql = build_insert_sql("servicos", &cols(&["id", "cidade"]), 2);
        assert_eq!(
            sql,
            "INSERT INTO `servicos` (`id`, `cidade`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn upsert_sql_excludes_key_from_updates() {
        let sql = build_upsert_sql(
            "service_appointment_history",
            &cols(&["id", "field_name", "new_value"]),
            "id",
            1,
        );
        assert!(sql.starts_with(
            "INSERT INTO `service_appointment_history` (`id`, `field_name`, `new_value`) VALUES (?, ?, ?) ON DUPLICATE KEY UPDATE "
        ));
        assert!(sql.contains("`field_name` = VALUES(`field_name`)"));
        assert!(sql.contains("`new_value` = VALUES(`new_value`)"));
        assert!(!sql.contains("`id` = VALUES(`id`)"));
    }

    #[test]
    fn placeholder_count_matches_rows_and_columns() {
        let sql = build_insert_sql("t", &cols(&["a", "b", "c"]), 3);
        assert_eq!(sql.matches('?').count(), 9);
    }

    #[test]
    fn connect_options_carry_credentials_with_reserved_characters() {
        let cfg = config::Warehouse {
            host: "db.internal".into(),
            port: 3307,
            database: "db_operacoes".into(),
            user: "etl".into(),
            password: "p@ss/w%rd:!".into(),
        };
        // No DSN is involved, so nothing gets percent-decoded or split on
        // '@'. The options still point at the configured host and schema.
        let dbg = format!("{:?}", connect_options(&cfg));
        assert!(dbg.contains("db.internal"));
        assert!(dbg.contains("db_operacoes"));
        assert!(dbg.contains("3307"));
    }
}
