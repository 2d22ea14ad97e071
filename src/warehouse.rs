//! Warehouse access for marketsync.
//!
//! The engine treats the warehouse through the narrow [`Warehouse`] trait:
//! look up rows by a key predicate, insert a row, update selected columns.
//! Each call is its own short transaction scope, so one record's failure
//! cannot roll back unrelated records. [`PostgresWarehouse`] is the stock
//! implementation; [`MemoryWarehouse`] is an in-process double for tests and
//! embedding.

use crate::config::{RetryConfig, SslMode, WarehouseConfig};
use crate::error::{Error, Result};
use crate::http::mask_url;
use crate::normalize::FieldValue;
use crate::schema::EntityNode;
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::Client;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(feature = "tls-native")]
use postgres_native_tls::MakeTlsConnector;

/// One existing warehouse row, as returned by a key lookup.
#[derive(Debug, Clone, Default)]
pub struct WarehouseRow {
    /// Column values
    pub attributes: IndexMap<String, FieldValue>,
}

impl WarehouseRow {
    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.attributes.get(column)
    }
}

/// Key/value predicate for row lookups: all pairs must match.
pub type KeyPredicate = [(String, FieldValue)];

/// The two-operation storage contract of the reconciler (lookup by natural
/// key, write row), plus the connectivity/DDL surface the orchestrator needs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Test connectivity.
    async fn ping(&self) -> Result<()>;

    /// Ensure the table for an entity node exists, with its natural-key
    /// uniqueness constraint and, for child tables, the parent foreign key.
    async fn ensure_table(&self, node: &EntityNode, parent_table: Option<&str>) -> Result<()>;

    /// Find rows matching a key predicate.
    async fn find(&self, table: &str, predicate: &KeyPredicate) -> Result<Vec<WarehouseRow>>;

    /// Insert one full row.
    async fn insert(&self, table: &str, row: &IndexMap<String, FieldValue>) -> Result<()>;

    /// Update selected columns on the first row matching the predicate.
    /// Returns the number of rows updated.
    async fn update(
        &self,
        table: &str,
        predicate: &KeyPredicate,
        changes: &IndexMap<String, FieldValue>,
    ) -> Result<u64>;

    /// Row count for a table.
    async fn count(&self, table: &str) -> Result<i64>;
}

/// Postgres-backed warehouse.
pub struct PostgresWarehouse {
    client: Client,
}

impl PostgresWarehouse {
    /// Connect, retrying transient failures with exponential backoff.
    ///
    /// An unreachable warehouse after retries is fatal for the entity run.
    #[instrument(skip(config, retry), fields(url = %mask_url(&config.url)))]
    pub async fn connect(config: &WarehouseConfig, retry: &RetryConfig) -> Result<Self> {
        info!("Connecting to warehouse...");

        let client = backoff::future::retry(create_backoff(retry), || async {
            Self::connect_once(config).await.map_err(|e| {
                if e.is_retryable() {
                    warn!("Warehouse connection attempt failed: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        info!("Connected to warehouse");
        Ok(Self { client })
    }

    async fn connect_once(config: &WarehouseConfig) -> Result<Client> {
        let pg_config = pg_config(config)?;

        #[cfg(feature = "tls-native")]
        if config.ssl_mode != SslMode::Disable {
            let connector = TlsConnector::builder()
                .build()
                .map_err(|e| Error::config_with_source("TLS setup failed", e))?;
            let connector = MakeTlsConnector::new(connector);
            let (client, connection) = pg_config
                .connect(connector)
                .await
                .map_err(|e| Error::warehouse_connection_pg("Failed to connect", e))?;
            spawn_driver(connection);
            return Ok(client);
        }

        #[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
        if config.ssl_mode != SslMode::Disable {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            let (client, connection) = pg_config
                .connect(connector)
                .await
                .map_err(|e| Error::warehouse_connection_pg("Failed to connect", e))?;
            spawn_driver(connection);
            return Ok(client);
        }

        let _ = &config.ssl_mode;
        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::warehouse_connection_pg("Failed to connect", e))?;
        spawn_driver(connection);
        Ok(client)
    }
}

/// Parse the connection URL and apply the configured connect timeout.
fn pg_config(config: &WarehouseConfig) -> Result<tokio_postgres::Config> {
    let mut pg: tokio_postgres::Config = config
        .url
        .parse()
        .map_err(|e| Error::warehouse_connection_pg("Invalid warehouse URL", e))?;
    if config.connect_timeout_secs > 0 {
        pg.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    }
    Ok(pg)
}

/// Drive a postgres connection on its own task.
fn spawn_driver<F>(connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Warehouse connection error: {}", e);
        }
    });
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn ping(&self) -> Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| Error::warehouse_query_pg("", "Ping failed", e))?;
        Ok(())
    }

    #[instrument(skip(self, node), fields(table = %node.table))]
    async fn ensure_table(&self, node: &EntityNode, parent_table: Option<&str>) -> Result<()> {
        let ddl = node.to_postgres_ddl(parent_table);
        debug!("Ensuring table with DDL: {}", ddl);
        self.client
            .batch_execute(&ddl)
            .await
            .map_err(|e| Error::warehouse_query_pg(&node.table, "Create table failed", e))?;
        Ok(())
    }

    async fn find(&self, table: &str, predicate: &KeyPredicate) -> Result<Vec<WarehouseRow>> {
        let query = format!(
            "SELECT * FROM {} WHERE {}",
            table,
            predicate_sql(predicate)
        );
        debug!("Executing lookup: {}", query);

        let messages = self
            .client
            .simple_query(&query)
            .await
            .map_err(|e| Error::warehouse_query_pg(table, "Lookup failed", e))?;

        let mut rows = Vec::new();
        for msg in messages {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = msg {
                rows.push(simple_row_to_warehouse_row(&row));
            }
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &IndexMap<String, FieldValue>) -> Result<()> {
        let columns: Vec<&str> = row.keys().map(|k| k.as_str()).collect();
        let values: Vec<String> = row.values().map(to_sql_literal).collect();
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            values.join(", ")
        );

        self.client
            .execute(&query, &[])
            .await
            .map_err(|e| Error::warehouse_query_pg(table, "Insert failed", e))?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        predicate: &KeyPredicate,
        changes: &IndexMap<String, FieldValue>,
    ) -> Result<u64> {
        let assignments: Vec<String> = changes
            .iter()
            .map(|(col, val)| format!("{} = {}", col, to_sql_literal(val)))
            .collect();
        // ctid subselect pins the update to one physical row, so duplicate
        // natural keys stay first-match-wins.
        let query = format!(
            "UPDATE {table} SET {} WHERE ctid = (SELECT ctid FROM {table} WHERE {} LIMIT 1)",
            assignments.join(", "),
            predicate_sql(predicate),
            table = table,
        );

        self.client
            .execute(&query, &[])
            .await
            .map_err(|e| Error::warehouse_query_pg(table, "Update failed", e))
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", table);
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .map_err(|e| Error::warehouse_query_pg(table, "Count failed", e))?;
        Ok(row.get(0))
    }
}

/// Create exponential backoff from retry config.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_randomization_factor(if config.jitter { 0.5 } else { 0.0 })
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(Some(Duration::from_secs(300)))
        .build()
}

fn predicate_sql(predicate: &KeyPredicate) -> String {
    predicate
        .iter()
        .map(|(col, val)| {
            if val.is_null() {
                format!("{} IS NULL", col)
            } else {
                format!("{} = {}", col, to_sql_literal(val))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Convert a typed cell to a SQL literal (quoted and escaped where needed).
fn to_sql_literal(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "NULL".to_string(),
        FieldValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        FieldValue::Integer(n) => n.to_string(),
        FieldValue::Decimal(d) => d.to_string(),
        FieldValue::Text(s) => quote(s),
        FieldValue::Timestamp(t) => quote(&t.to_rfc3339()),
        FieldValue::Json(v) => quote(&v.to_string()),
    }
}

fn quote(s: &str) -> String {
    // Escape single quotes by doubling them.
    format!("'{}'", s.replace('\'', "''"))
}

/// In simple-query mode all values come back as strings.
fn simple_row_to_warehouse_row(row: &tokio_postgres::SimpleQueryRow) -> WarehouseRow {
    let mut attributes = IndexMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = row
            .get(i)
            .map(|s: &str| FieldValue::Text(s.to_string()))
            .unwrap_or(FieldValue::Null);
        attributes.insert(column.name().to_string(), value);
    }
    WarehouseRow { attributes }
}

/// In-process warehouse double.
///
/// Enforces the parent foreign key the way the relational schema would, so
/// reconciliation failure paths (missing parent) behave as in production.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: tokio::sync::Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<IndexMap<String, FieldValue>>>,
    parents: HashMap<String, String>,
}

impl MemoryWarehouse {
    /// Create an empty warehouse.
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows currently in a table (test helper).
    pub async fn rows(&self, table: &str) -> Vec<IndexMap<String, FieldValue>> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    /// Seed a raw row, bypassing foreign key checks (test helper).
    pub async fn seed(&self, table: &str, row: IndexMap<String, FieldValue>) {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default().push(row);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_table(&self, node: &EntityNode, parent_table: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tables.entry(node.table.clone()).or_default();
        if let Some(parent) = parent_table {
            state.parents.insert(node.table.clone(), parent.to_string());
        }
        Ok(())
    }

    async fn find(&self, table: &str, predicate: &KeyPredicate) -> Result<Vec<WarehouseRow>> {
        let state = self.state.lock().await;
        let rows = state.tables.get(table).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|row| matches_predicate(row, predicate))
            .map(|attributes| WarehouseRow { attributes })
            .collect())
    }

    async fn insert(&self, table: &str, row: &IndexMap<String, FieldValue>) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(parent_table) = state.parents.get(table).cloned() {
            if let Some(FieldValue::Text(parent_key)) = row.get("parent_key") {
                let parent_exists = state
                    .tables
                    .get(&parent_table)
                    .map(|rows| {
                        rows.iter().any(|r| {
                            r.get("natural_key") == Some(&FieldValue::Text(parent_key.clone()))
                        })
                    })
                    .unwrap_or(false);
                if !parent_exists {
                    return Err(Error::warehouse_query(
                        table,
                        format!(
                            "foreign key violation: no row in '{}' with natural_key '{}'",
                            parent_table, parent_key
                        ),
                    ));
                }
            }
        }

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        predicate: &KeyPredicate,
        changes: &IndexMap<String, FieldValue>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        // First match wins, as with the ctid-pinned SQL update.
        for row in rows.iter_mut() {
            if matches_predicate(row, predicate) {
                for (col, val) in changes {
                    row.insert(col.clone(), val.clone());
                }
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.tables.get(table).map(|r| r.len()).unwrap_or(0) as i64)
    }
}

fn matches_predicate(row: &IndexMap<String, FieldValue>, predicate: &KeyPredicate) -> bool {
    predicate
        .iter()
        .all(|(col, val)| row.get(col) == Some(val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityNode, FieldSpec, FieldType};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn test_sql_literals() {
        assert_eq!(to_sql_literal(&FieldValue::Null), "NULL");
        assert_eq!(to_sql_literal(&FieldValue::Bool(true)), "TRUE");
        assert_eq!(to_sql_literal(&FieldValue::Integer(42)), "42");
        assert_eq!(
            to_sql_literal(&FieldValue::Decimal(BigDecimal::from_str("19.90").unwrap())),
            "19.90"
        );
        assert_eq!(to_sql_literal(&text("it's")), "'it''s'");
    }

    #[test]
    fn test_connect_timeout_is_applied() {
        let config = WarehouseConfig {
            url: "postgres://user:pw@localhost:5432/warehouse".into(),
            connect_timeout_secs: 15,
            ssl_mode: SslMode::Disable,
        };
        let pg = pg_config(&config).unwrap();
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(15)));

        let config = WarehouseConfig {
            connect_timeout_secs: 0,
            ..config
        };
        let pg = pg_config(&config).unwrap();
        assert_eq!(pg.get_connect_timeout(), None);
    }

    #[test]
    fn test_backoff_honors_jitter_flag() {
        let retry = RetryConfig::default();
        assert!(retry.jitter);
        let backoff = create_backoff(&retry);
        assert!(backoff.randomization_factor > 0.0);

        let retry = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        let backoff = create_backoff(&retry);
        assert_eq!(backoff.randomization_factor, 0.0);
        assert_eq!(backoff.initial_interval, retry.initial_backoff());
    }

    #[test]
    fn test_predicate_sql() {
        let predicate = vec![
            ("merchant_id".to_string(), text("m1")),
            ("fact_quality".to_string(), FieldValue::Null),
        ];
        assert_eq!(
            predicate_sql(&predicate),
            "merchant_id = 'm1' AND fact_quality IS NULL"
        );
    }

    #[tokio::test]
    async fn test_memory_insert_find_update() {
        let wh = MemoryWarehouse::new();
        let mut row = IndexMap::new();
        row.insert("natural_key".to_string(), text("m1-o1"));
        row.insert("status".to_string(), text("active"));
        wh.insert("offers", &row).await.unwrap();

        let predicate = vec![("natural_key".to_string(), text("m1-o1"))];
        let found = wh.find("offers", &predicate).await.unwrap();
        assert_eq!(found.len(), 1);

        let mut changes = IndexMap::new();
        changes.insert("status".to_string(), text("sold_out"));
        let updated = wh.update("offers", &predicate, &changes).await.unwrap();
        assert_eq!(updated, 1);

        let rows = wh.rows("offers").await;
        assert_eq!(rows[0]["status"], text("sold_out"));
        assert_eq!(wh.count("offers").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_update_first_match_only() {
        let wh = MemoryWarehouse::new();
        for status in ["a", "b"] {
            let mut row = IndexMap::new();
            row.insert("natural_key".to_string(), text("dup"));
            row.insert("status".to_string(), text(status));
            wh.seed("offers", row).await;
        }

        let predicate = vec![("natural_key".to_string(), text("dup"))];
        let mut changes = IndexMap::new();
        changes.insert("status".to_string(), text("z"));
        assert_eq!(wh.update("offers", &predicate, &changes).await.unwrap(), 1);

        let rows = wh.rows("offers").await;
        assert_eq!(rows[0]["status"], text("z"));
        assert_eq!(rows[1]["status"], text("b"));
    }

    #[tokio::test]
    async fn test_memory_enforces_parent_fk() {
        let wh = MemoryWarehouse::new();
        let parent = EntityNode::new("offers", "{id}")
            .field(FieldSpec::new("id", FieldType::Text));
        let child = EntityNode::new("offer_outlets", "{parent.key}-{id}")
            .field(FieldSpec::new("id", FieldType::Text));
        wh.ensure_table(&parent, None).await.unwrap();
        wh.ensure_table(&child, Some("offers")).await.unwrap();

        let mut orphan = IndexMap::new();
        orphan.insert("natural_key".to_string(), text("missing-x"));
        orphan.insert("parent_key".to_string(), text("missing"));
        let err = wh.insert("offer_outlets", &orphan).await.unwrap_err();
        assert!(err.to_string().contains("foreign key violation"));
    }
}
