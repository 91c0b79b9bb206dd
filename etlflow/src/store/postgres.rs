//! PostgreSQL stores and a query-backed extractor.
//!
//! A flush streams rows with `COPY` into a temporary table that mirrors the
//! target's columns plus an arrival counter, then reconciles with a single
//! statement keyed by primary key. When a key repeats within one flush the
//! first arrival wins.

use super::{MetadataStore, RunEntity, StepRecord, StepRunEntity, TargetStore};
use crate::config::DatabaseConfig;
use crate::core::{NodeOutput, RunStatus, StepRunStatus};
use crate::errors::{EtlError, StoreError};
use crate::graph::{AttrType, Extractor, LoadEntity, PreparedRow, StepDefinition, WriteMode, WriteStats};
use crate::pipeline::StepStats;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::{PgDatabaseError, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const ARRIVAL_COLUMN: &str = "__etl_arrival";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNDEFINED_TABLE: &str = "42P01";
const EXTRACT_CHANNEL_CAPACITY: usize = 1024;

static FK_DETAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Key \((?P<column>[^)]+)\)=\((?P<value>[^)]*)\)").ok());

/// Opens a connection pool sized by `config`.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] when the database cannot be reached.
pub async fn create_pool(config: &DatabaseConfig, url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(url)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );
    Ok(pool)
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let pg = db.try_downcast_ref::<PgDatabaseError>();
            match code.as_str() {
                FOREIGN_KEY_VIOLATION => {
                    let table = pg.and_then(PgDatabaseError::table).unwrap_or_default();
                    match pg.and_then(PgDatabaseError::detail).and_then(parse_fk_detail) {
                        Some((column, value)) => StoreError::ForeignKeyViolation {
                            table: table.to_string(),
                            column,
                            value,
                        },
                        None => StoreError::Query(err.to_string()),
                    }
                }
                UNDEFINED_TABLE => StoreError::UnknownTable(db.message().to_string()),
                _ => StoreError::Query(err.to_string()),
            }
        }
        _ => StoreError::Query(err.to_string()),
    }
}

/// Extracts the column and value from a foreign-key violation detail such
/// as `Key (parent_id)=(42) is not present in table "parent".`
fn parse_fk_detail(detail: &str) -> Option<(String, String)> {
    let caps = FK_DETAIL.as_ref()?.captures(detail)?;
    Some((caps["column"].to_string(), caps["value"].to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(entity: &LoadEntity) -> String {
    entity.schema().map_or_else(
        || quote_ident(entity.table()),
        |schema| format!("{}.{}", quote_ident(schema), quote_ident(entity.table())),
    )
}

fn temp_table(entity: &LoadEntity) -> String {
    quote_ident(&format!("etl_tmp_{}", entity.table()))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// `CREATE TEMP TABLE` mirroring the target's columns, dropped at commit.
#[must_use]
pub fn build_temp_table_sql(entity: &LoadEntity, columns: &[String]) -> String {
    format!(
        "CREATE TEMP TABLE {} ON COMMIT DROP AS SELECT {} FROM {} WITH NO DATA",
        temp_table(entity),
        column_list(columns),
        qualified(entity),
    )
}

/// Adds the arrival counter that orders rows within one flush.
#[must_use]
pub fn build_arrival_sql(entity: &LoadEntity) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} bigserial",
        temp_table(entity),
        quote_ident(ARRIVAL_COLUMN)
    )
}

/// `COPY ... FROM STDIN` into the temporary table.
#[must_use]
pub fn build_copy_sql(entity: &LoadEntity, columns: &[String]) -> String {
    format!("COPY {} ({}) FROM STDIN", temp_table(entity), column_list(columns))
}

fn first_arrivals(entity: &LoadEntity, columns: &[String]) -> String {
    let pk = quote_ident(entity.primary_key());
    format!(
        "SELECT DISTINCT ON ({pk}) {} FROM {} ORDER BY {pk}, {}",
        column_list(columns),
        temp_table(entity),
        quote_ident(ARRIVAL_COLUMN),
    )
}

/// The reconciliation statement. Returns `(inserted, updated)` counts.
///
/// ```sql
/// WITH written AS (
///     INSERT INTO "t" ("id", "x") SELECT DISTINCT ON ("id") ... ORDER BY "id", arrival
///     ON CONFLICT ("id") DO UPDATE SET "x" = EXCLUDED."x"
///     RETURNING (xmax = 0) AS inserted
/// ) SELECT ...
/// ```
#[must_use]
pub fn build_reconcile_sql(entity: &LoadEntity, columns: &[String], mode: WriteMode) -> String {
    let pk = quote_ident(entity.primary_key());
    let rest: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != entity.primary_key())
        .map(|c| quote_ident(c))
        .collect();
    match mode {
        WriteMode::Insert => {
            let set = if rest.is_empty() {
                format!("{pk} = EXCLUDED.{pk}")
            } else {
                rest.iter()
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!(
                "WITH written AS (\
                 INSERT INTO {} ({}) {} \
                 ON CONFLICT ({pk}) DO UPDATE SET {set} \
                 RETURNING (xmax = 0) AS inserted) \
                 SELECT count(*) FILTER (WHERE inserted), count(*) FILTER (WHERE NOT inserted) FROM written",
                qualified(entity),
                column_list(columns),
                first_arrivals(entity, columns),
            )
        }
        WriteMode::Update => {
            let set = if rest.is_empty() {
                format!("{pk} = s.{pk}")
            } else {
                rest.iter()
                    .map(|c| format!("{c} = s.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!(
                "WITH written AS (\
                 UPDATE {} AS t SET {set} FROM ({}) AS s WHERE t.{pk} = s.{pk} RETURNING 1) \
                 SELECT 0::bigint, count(*) FROM written",
                qualified(entity),
                first_arrivals(entity, columns),
            )
        }
    }
}

/// Renders rows in COPY text format, one line per row.
#[must_use]
pub fn copy_payload(entity: &LoadEntity, columns: &[String], rows: &[PreparedRow]) -> Vec<u8> {
    let types: Vec<AttrType> = columns
        .iter()
        .map(|c| entity.column_type(c).unwrap_or(AttrType::Text))
        .collect();
    let mut out = String::new();
    for row in rows {
        for (i, (ty, value)) in types.iter().zip(&row.values).enumerate() {
            if i > 0 {
                out.push('\t');
            }
            out.push_str(&ty.to_copy_text(value));
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// A target store writing to PostgreSQL tables.
#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    /// Creates a store over `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn bulk_write(
        &self,
        entity: &LoadEntity,
        columns: &[String],
        rows: &[PreparedRow],
        mode: WriteMode,
    ) -> Result<WriteStats, StoreError> {
        if rows.is_empty() {
            return Ok(WriteStats::default());
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(&build_temp_table_sql(entity, columns))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query(&build_arrival_sql(entity))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let mut copy = tx
            .copy_in_raw(&build_copy_sql(entity, columns))
            .await
            .map_err(map_sqlx)?;
        copy.send(copy_payload(entity, columns, rows))
            .await
            .map_err(map_sqlx)?;
        let copied = copy.finish().await.map_err(map_sqlx)?;

        let (inserted, updated): (i64, i64) = sqlx::query_as(&build_reconcile_sql(entity, columns, mode))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        tracing::debug!(
            table = %entity.qualified_name(),
            copied,
            inserted,
            updated,
            "Flushed rows"
        );
        Ok(WriteStats {
            inserted: u64::try_from(inserted).unwrap_or(0),
            updated: u64::try_from(updated).unwrap_or(0),
            dropped: 0,
        })
    }

    async fn row_count(&self, entity: &LoadEntity) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", qualified(entity)))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS etl_run (
        id uuid PRIMARY KEY,
        status text NOT NULL,
        started_at timestamptz,
        completed_at timestamptz,
        error_count bigint NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS etl_step (
        id uuid PRIMARY KEY,
        name text NOT NULL,
        description text,
        tags text[] NOT NULL DEFAULT '{}',
        tables_needed text[] NOT NULL DEFAULT '{}',
        columns_needed text[] NOT NULL DEFAULT '{}',
        tables_yielded text[] NOT NULL DEFAULT '{}',
        columns_yielded text[] NOT NULL DEFAULT '{}',
        definition jsonb NOT NULL,
        updated_at timestamptz NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS etl_step_run (
        step_id uuid NOT NULL REFERENCES etl_step (id),
        run_id uuid NOT NULL REFERENCES etl_run (id),
        step_name text NOT NULL,
        ordering integer,
        status text NOT NULL,
        stats jsonb NOT NULL,
        error text,
        rendered_query text,
        started_at timestamptz,
        completed_at timestamptz,
        PRIMARY KEY (step_id, run_id)
    )",
    "CREATE TABLE IF NOT EXISTS etl_repeat (
        step_id uuid NOT NULL,
        input_hash uuid NOT NULL,
        PRIMARY KEY (step_id, input_hash)
    )",
];

/// Run, step and repeat state in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Creates a store over `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the metadata tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when a statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        tracing::info!("Metadata tables ready");
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn step_run_from_row(row: &PgRow) -> Result<StepRunEntity, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let Json(stats): Json<StepStats> = row.try_get("stats")?;
    Ok(StepRunEntity {
        step_id: row.try_get("step_id")?,
        run_id: row.try_get("run_id")?,
        step_name: row.try_get("step_name")?,
        ordering: row.try_get("ordering")?,
        status: StepRunStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: format!("unknown step run status '{status}'").into(),
        })?,
        stats,
        error: row.try_get("error")?,
        rendered_query: row.try_get("rendered_query")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn create_run(&self, run: &RunEntity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO etl_run (id, status, started_at, completed_at, error_count) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(to_i64(run.error_count))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_run(&self, run: &RunEntity) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE etl_run SET status = $2, started_at = $3, completed_at = $4, error_count = $5 WHERE id = $1",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(to_i64(run.error_count))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunEntity>, StoreError> {
        let row = sqlx::query("SELECT id, status, started_at, completed_at, error_count FROM etl_run WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(map_sqlx)?;
        let error_count: i64 = row.try_get("error_count").map_err(map_sqlx)?;
        Ok(Some(RunEntity {
            id: row.try_get("id").map_err(map_sqlx)?,
            status: RunStatus::parse(&status)
                .ok_or_else(|| StoreError::Query(format!("Unknown run status '{status}'")))?,
            started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at").map_err(map_sqlx)?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at").map_err(map_sqlx)?,
            error_count: u64::try_from(error_count).unwrap_or(0),
        }))
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO etl_step (id, name, description, tags, tables_needed, columns_needed, \
             tables_yielded, columns_yielded, definition) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, description = EXCLUDED.description, \
             tags = EXCLUDED.tags, tables_needed = EXCLUDED.tables_needed, \
             columns_needed = EXCLUDED.columns_needed, tables_yielded = EXCLUDED.tables_yielded, \
             columns_yielded = EXCLUDED.columns_yielded, definition = EXCLUDED.definition, updated_at = now()",
        )
        .bind(step.id)
        .bind(&step.name)
        .bind(&step.description)
        .bind(&step.tags)
        .bind(&step.tables_needed)
        .bind(&step.columns_needed)
        .bind(&step.tables_yielded)
        .bind(&step.columns_yielded)
        .bind(Json::<&StepDefinition>(&step.definition))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn save_step_run(&self, step_run: &StepRunEntity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO etl_step_run (step_id, run_id, step_name, ordering, status, stats, error, \
             rendered_query, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (step_id, run_id) DO UPDATE SET ordering = EXCLUDED.ordering, \
             status = EXCLUDED.status, stats = EXCLUDED.stats, error = EXCLUDED.error, \
             rendered_query = EXCLUDED.rendered_query, started_at = EXCLUDED.started_at, \
             completed_at = EXCLUDED.completed_at",
        )
        .bind(step_run.step_id)
        .bind(step_run.run_id)
        .bind(&step_run.step_name)
        .bind(step_run.ordering)
        .bind(step_run.status.as_str())
        .bind(Json(step_run.stats))
        .bind(&step_run.error)
        .bind(&step_run.rendered_query)
        .bind(step_run.started_at)
        .bind(step_run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRunEntity>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_id, run_id, step_name, ordering, status, stats, error, rendered_query, \
             started_at, completed_at FROM etl_step_run WHERE run_id = $1 ORDER BY ordering NULLS LAST",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| step_run_from_row(row).map_err(map_sqlx))
            .collect()
    }

    async fn load_repeats(&self, step_id: Uuid) -> Result<HashSet<Uuid>, StoreError> {
        let hashes: Vec<Uuid> = sqlx::query_scalar("SELECT input_hash FROM etl_repeat WHERE step_id = $1")
            .bind(step_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(hashes.into_iter().collect())
    }

    async fn persist_repeats(&self, step_id: Uuid, hashes: &[Uuid]) -> Result<(), StoreError> {
        if hashes.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO etl_repeat (step_id, input_hash) SELECT $1, unnest($2::uuid[]) \
             ON CONFLICT DO NOTHING",
        )
        .bind(step_id)
        .bind(hashes)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

/// Streams the rows of a SQL query, each as a mapping of column name to
/// value.
#[derive(Debug, Clone)]
pub struct QueryExtract {
    pool: PgPool,
    query: String,
}

impl QueryExtract {
    /// Creates an extractor for `query`.
    #[must_use]
    pub fn new(pool: PgPool, query: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
        }
    }

    /// The count query derived from the extract query.
    #[must_use]
    pub fn count_query(&self) -> String {
        count_query(&self.query)
    }
}

fn count_query(query: &str) -> String {
    format!("SELECT count(*) FROM ({}) AS q", query.trim().trim_end_matches(';'))
}

fn column_value(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    let column = &row.columns()[index];
    let value = match column.type_info().name() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(Value::from),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::from),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)?
            .map(|u| Value::String(u.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index)?,
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|t| Value::String(t.and_utc().to_rfc3339())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|d| Value::String(d.to_string())),
        _ => row.try_get::<Option<String>, _>(index)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn row_to_output(row: &PgRow) -> Result<NodeOutput, EtlError> {
    let mut map = Map::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = column_value(row, i).map_err(|e| {
            EtlError::Extract(format!(
                "Cannot decode column '{}' ({}): {e}. Cast it to a supported type in the query.",
                column.name(),
                column.type_info().name()
            ))
        })?;
        map.insert(column.name().to_string(), value);
    }
    Ok(NodeOutput::from(map))
}

#[async_trait]
impl Extractor for QueryExtract {
    async fn extract(&self) -> Result<BoxStream<'static, Result<NodeOutput, EtlError>>, EtlError> {
        let (tx, rx) = mpsc::channel(EXTRACT_CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let query = self.query.clone();
        tokio::spawn(async move {
            let mut rows = sqlx::query(&query).fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .map_err(|e| EtlError::Extract(map_sqlx(e).to_string()))
                    .and_then(|r| row_to_output(&r));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn length(&self) -> Result<Option<u64>, EtlError> {
        let count: i64 = sqlx::query_scalar(&self.count_query())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EtlError::Extract(map_sqlx(e).to_string()))?;
        Ok(u64::try_from(count).ok())
    }

    fn definition(&self) -> String {
        self.query.clone()
    }

    fn rendered_query(&self) -> Option<String> {
        Some(self.query.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> LoadEntity {
        LoadEntity::builder("child")
            .schema("public")
            .identifying_attribute("name", AttrType::Text)
            .foreign_key("parent_id", "parent")
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_fk_detail() {
        let detail = r#"Key (parent_id)=(6f1c9a36-0d8a-4c1e-9d0e-0a4f5b7e2c11) is not present in table "parent"."#;
        assert_eq!(
            parse_fk_detail(detail),
            Some((
                "parent_id".to_string(),
                "6f1c9a36-0d8a-4c1e-9d0e-0a4f5b7e2c11".to_string()
            ))
        );
        assert_eq!(parse_fk_detail("something else"), None);
    }

    #[test]
    fn test_insert_sql_dedups_by_first_arrival() {
        let e = entity();
        let sql = build_reconcile_sql(&e, &e.columns(), WriteMode::Insert);
        assert!(sql.contains(r#"INSERT INTO "public"."child""#));
        assert!(sql.contains(r#"SELECT DISTINCT ON ("id")"#));
        assert!(sql.contains(r#"ORDER BY "id", "__etl_arrival""#));
        assert!(sql.contains(r#"ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name""#));
        assert!(sql.contains("RETURNING (xmax = 0)"));
    }

    #[test]
    fn test_update_sql_joins_on_key() {
        let e = entity();
        let sql = build_reconcile_sql(&e, &e.columns(), WriteMode::Update);
        assert!(sql.contains(r#"UPDATE "public"."child" AS t"#));
        assert!(sql.contains(r#"WHERE t."id" = s."id""#));
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_temp_table_and_copy_sql() {
        let e = entity();
        let columns = e.columns();
        assert_eq!(
            build_temp_table_sql(&e, &columns),
            r#"CREATE TEMP TABLE "etl_tmp_child" ON COMMIT DROP AS SELECT "id", "name", "parent_id" FROM "public"."child" WITH NO DATA"#
        );
        assert_eq!(
            build_copy_sql(&e, &columns),
            r#"COPY "etl_tmp_child" ("id", "name", "parent_id") FROM STDIN"#
        );
    }

    #[test]
    fn test_copy_payload_escapes_and_nulls() {
        let e = entity();
        let key = Uuid::nil();
        let rows = vec![PreparedRow {
            key,
            values: vec![json!(key.to_string()), json!("a\tb"), Value::Null],
        }];
        let payload = String::from_utf8(copy_payload(&e, &e.columns(), &rows)).unwrap();
        assert_eq!(payload, format!("{key}\ta\\tb\t\\N\n"));
    }

    #[test]
    fn test_count_query_wraps_statement() {
        assert_eq!(
            count_query("SELECT id FROM source;\n"),
            "SELECT count(*) FROM (SELECT id FROM source) AS q"
        );
    }
}
