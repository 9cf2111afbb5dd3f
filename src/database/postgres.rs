//! PostgreSQL sink implementation
//!
//! Writes datasets through a single `tokio-postgres` client. Each
//! `write_table` call runs inside one transaction.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;

use super::{
    ConnectionParams, DatabaseError, DatabaseResult, TableRef, TableShape, TableSink, WriteMode,
    quote_ident,
};
use crate::config::SslMode;
use crate::load::{ColumnType, Dataset};

/// PostgreSQL caps bind parameters per statement at 65535
const MAX_BIND_PARAMS: usize = 65_535;

/// Default upper bound on rows per INSERT statement
pub const DEFAULT_BATCH_ROWS: usize = 1000;

/// PostgreSQL table sink
pub struct PostgresSink {
    /// PostgreSQL client (wrapped for async access)
    client: Arc<Mutex<tokio_postgres::Client>>,
    default_schema: String,
    batch_rows: usize,
}

impl PostgresSink {
    /// Connect using resolved connection parameters
    ///
    /// Must be called from within a Tokio runtime; the connection task is
    /// spawned onto it.
    pub async fn connect(params: &ConnectionParams, sslmode: SslMode) -> DatabaseResult<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&params.host)
            .port(params.port)
            .user(&params.user)
            .password(&params.password)
            .dbname(&params.dbname)
            .connect_timeout(Duration::from_secs(30))
            .ssl_mode(match sslmode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require => tokio_postgres::config::SslMode::Require,
            });

        // A tunnelled server presents its own certificate on a loopback address.
        let loopback = params.host == "localhost"
            || params
                .host
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_hostnames(loopback)
            .build()
            .map_err(|e| DatabaseError::ConnectionFailed(format!("TLS setup failed: {}", e)))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = config.connect(tls).await.map_err(|e| {
            DatabaseError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                params.connection_string_masked(),
                e
            ))
        })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        tracing::info!("Connected to {}", params.connection_string_masked());

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            default_schema: params.schema.clone(),
            batch_rows: DEFAULT_BATCH_ROWS,
        })
    }

    /// Set the upper bound on rows per INSERT statement
    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    /// Execute one or more statements without parameters
    pub async fn batch_execute(&self, sql: &str) -> DatabaseResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))
    }

    /// Row count and column names of an existing table
    pub async fn table_shape(&self, table: &TableRef) -> DatabaseResult<TableShape> {
        let client = self.client.lock().await;

        let columns: Vec<String> = client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .collect();

        if columns.is_empty() {
            return Err(DatabaseError::QueryFailed(format!(
                "Table {} does not exist",
                table
            )));
        }

        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", table.qualified()), &[])
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        let row_count: i64 = row.get(0);

        Ok(TableShape {
            row_count: row_count as u64,
            columns,
        })
    }

    fn rows_per_statement(&self, column_count: usize) -> usize {
        (MAX_BIND_PARAMS / column_count.max(1))
            .min(self.batch_rows)
            .max(1)
    }
}

#[async_trait(?Send)]
impl TableSink for PostgresSink {
    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    async fn ensure_schema(&self, schema: &str) -> DatabaseResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .await
            .map_err(|e| DatabaseError::SchemaFailed {
                schema: schema.to_string(),
                message: e.to_string(),
            })
    }

    async fn write_table(
        &self,
        dataset: &Dataset,
        table: &TableRef,
        mode: WriteMode,
    ) -> DatabaseResult<u64> {
        let write_err = |e: tokio_postgres::Error| DatabaseError::WriteFailed {
            table: table.to_string(),
            message: e.to_string(),
        };

        let types = dataset.column_types();
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(write_err)?;

        if mode == WriteMode::Replace {
            tx.batch_execute(&format!("DROP TABLE IF EXISTS {}", table.qualified()))
                .await
                .map_err(write_err)?;
        }

        // Appends bind to the types the table already has.
        let existing: HashMap<String, String> = if mode == WriteMode::Append {
            tx.query(
                "SELECT attname::text, format_type(atttypid, atttypmod) FROM pg_attribute \
                 WHERE attrelid = to_regclass($1) AND attnum > 0 AND NOT attisdropped",
                &[&table.qualified()],
            )
            .await
            .map_err(write_err)?
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect()
        } else {
            HashMap::new()
        };
        let targets = target_types(dataset.columns(), &types, &existing);

        tx.batch_execute(&create_table_sql(table, dataset.columns(), &types))
            .await
            .map_err(write_err)?;

        let mut inserted = 0u64;
        let per_statement = self.rows_per_statement(dataset.column_count());
        for chunk in dataset.rows().chunks(per_statement) {
            let sql = insert_sql(table, dataset.columns(), &targets, chunk.len());
            let values: Vec<Option<&str>> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|cell| cell.as_deref()))
                .collect();
            let refs: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

            inserted += tx.execute(sql.as_str(), &refs).await.map_err(write_err)?;
            tracing::debug!("Inserted batch of {} rows into {}", chunk.len(), table);
        }

        tx.commit().await.map_err(write_err)?;
        Ok(inserted)
    }
}

fn create_table_sql(table: &TableRef, columns: &[String], types: &[ColumnType]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .zip(types)
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql_type()))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.qualified(),
        defs.join(", ")
    )
}

/// SQL type each column is cast to on insert
///
/// Columns already present in the table keep their type; new ones use the
/// inferred type.
fn target_types(
    columns: &[String],
    inferred: &[ColumnType],
    existing: &HashMap<String, String>,
) -> Vec<String> {
    columns
        .iter()
        .zip(inferred)
        .map(|(name, ty)| {
            existing
                .get(name)
                .cloned()
                .unwrap_or_else(|| ty.sql_type().to_string())
        })
        .collect()
}

/// Multi-row INSERT binding every value as text
///
/// The server converts each value to its target type. Integer targets go
/// through `numeric` so decimal text is rounded rather than rejected.
fn insert_sql(table: &TableRef, columns: &[String], targets: &[String], rows: usize) -> String {
    let width = columns.len();
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let tuples: Vec<String> = (0..rows)
        .map(|r| {
            let placeholders: Vec<String> = targets
                .iter()
                .enumerate()
                .map(|(c, target)| {
                    let n = r * width + c + 1;
                    if target.eq_ignore_ascii_case("text") {
                        format!("${}::text", n)
                    } else if is_integer_type(target) {
                        format!("${}::text::numeric::{}", n, target)
                    } else {
                        format!("${}::text::{}", n, target)
                    }
                })
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.qualified(),
        column_list.join(", "),
        tuples.join(", ")
    )
}

fn is_integer_type(sql_type: &str) -> bool {
    ["bigint", "integer", "smallint"]
        .iter()
        .any(|t| sql_type.eq_ignore_ascii_case(t))
}
