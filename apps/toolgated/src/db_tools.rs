//! Read-only database connector: `db.query` and `db.schema`.
//!
//! `db.query` runs caller SQL through a read-only verifier before it reaches
//! the driver: comments are stripped, multi-statement input is rejected, a
//! keyword blocklist is matched on whole words, and the first token must be
//! a read verb. Parameterization is still the caller's tool for injection
//! safety; the verifier bounds the blast radius, it does not parse SQL.
//!
//! `db.schema` only ever issues two canned `information_schema` queries with
//! bound parameters, so no caller-controlled SQL is interpolated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::TryStreamExt as _;
use serde_json::{Map, Value, json};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, PgPool, Postgres, Row as _, TypeInfo as _};
use toolgate_core::{
    FieldType, GatewayError, InputSchema, Tool, ToolContext, ToolHandler,
};
use uuid::Uuid;

use crate::config::DbConfig;

/// Statement-modifying keywords rejected anywhere in the input.
const BLOCKED_KEYWORDS: [&str; 16] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "EXECUTE", "CALL", "COPY", "LOAD", "SET", "LOCK", "UNLOCK",
];

/// Server-side functions with filesystem or large-object reach.
const BLOCKED_FUNCTIONS: [&str; 6] = [
    "PG_READ_FILE",
    "PG_WRITE_FILE",
    "PG_FILE_WRITE",
    "LO_IMPORT",
    "LO_EXPORT",
    "COPY",
];

const ALLOWED_PREFIXES: [&str; 3] = ["SELECT", "WITH", "EXPLAIN"];

pub fn tools(config: DbConfig) -> anyhow::Result<Vec<Tool>> {
    let url = config
        .url
        .clone()
        .context("database.url is required to register db tools")?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect_lazy(&url)
        .context("build database pool")?;
    let shared = Arc::new(Db { pool, config });

    Ok(vec![
        Tool::new(
            "db.query",
            "Run a read-only SQL query",
            InputSchema::new()
                .required("sql", FieldType::string_len(Some(1), None), "SQL text")
                .optional(
                    "params",
                    FieldType::array_of(FieldType::any()),
                    "Positional query parameters",
                ),
            Arc::new(QueryTool {
                db: Arc::clone(&shared),
            }),
        ),
        Tool::new(
            "db.schema",
            "Describe tables or columns via information_schema",
            InputSchema::new()
                .optional("table", FieldType::string_len(Some(1), None), "Table to describe")
                .with_default(
                    "schema",
                    FieldType::string_len(Some(1), None),
                    "Schema to inspect",
                    json!("public"),
                ),
            Arc::new(SchemaTool { db: shared }),
        ),
    ])
}

fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            out.push(' ');
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn normalize(sql: &str) -> String {
    strip_comments(sql)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Reject anything that is not a single read-only statement.
pub(crate) fn verify_read_only(sql: &str) -> Result<(), GatewayError> {
    let normalized = normalize(sql);
    if normalized.is_empty() {
        return Err(GatewayError::security("empty statement"));
    }

    let segments = normalized
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .count();
    if segments > 1 {
        return Err(GatewayError::security(
            "multiple statements are not allowed",
        ));
    }

    let words: Vec<&str> = normalized
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    for word in &words {
        if BLOCKED_KEYWORDS.contains(word) {
            return Err(GatewayError::security(format!(
                "forbidden keyword: {word}"
            )));
        }
    }
    let first = words.first().copied().unwrap_or_default();
    if !ALLOWED_PREFIXES.contains(&first) {
        return Err(GatewayError::security(
            "statement must start with SELECT, WITH, or EXPLAIN",
        ));
    }
    for func in BLOCKED_FUNCTIONS {
        if words.contains(&func) {
            return Err(GatewayError::security(format!(
                "forbidden function: {func}"
            )));
        }
    }
    Ok(())
}

struct Db {
    pool: PgPool,
    config: DbConfig,
}

impl Db {
    /// Acquire a connection with the statement timeout applied. The pooled
    /// connection returns to the pool on drop, on every exit path.
    async fn acquire(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Postgres>, GatewayError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| GatewayError::connector(format!("acquire connection: {e}")))?;
        sqlx::query(&format!(
            "SET statement_timeout = {}",
            self.config.query_timeout_ms
        ))
        .execute(conn.as_mut())
        .await
        .map_err(|e| GatewayError::connector(format!("set statement_timeout: {e}")))?;
        Ok(conn)
    }

    async fn run<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<(Vec<Value>, bool), GatewayError> {
        let mut conn = self.acquire().await?;
        let mut rows = Vec::new();
        let mut truncated = false;
        let mut stream = query.fetch(conn.as_mut());
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| GatewayError::connector(format!("query failed: {e}")))?
        {
            if rows.len() >= self.config.max_rows {
                truncated = true;
                break;
            }
            rows.push(row_to_json(&row));
        }
        Ok((rows, truncated))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            query.bind(n.as_i64().unwrap_or_default())
        }
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        out.insert(
            column.name().to_string(),
            column_to_json(row, i, column.type_info().name()),
        );
    }
    Value::Object(out)
}

fn column_to_json(row: &PgRow, i: usize, type_name: &str) -> Value {
    fn wrap<T: Into<Value>>(v: Result<Option<T>, sqlx::Error>) -> Value {
        v.ok().flatten().map(Into::into).unwrap_or(Value::Null)
    }

    match type_name {
        "BOOL" => wrap(row.try_get::<Option<bool>, _>(i)),
        "INT2" => wrap(row.try_get::<Option<i16>, _>(i).map(|o| o.map(i64::from))),
        "INT4" => wrap(row.try_get::<Option<i32>, _>(i).map(|o| o.map(i64::from))),
        "INT8" => wrap(row.try_get::<Option<i64>, _>(i)),
        "FLOAT4" => wrap(row.try_get::<Option<f32>, _>(i).map(|o| o.map(f64::from))),
        "FLOAT8" => wrap(row.try_get::<Option<f64>, _>(i)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => {
            wrap(row.try_get::<Option<String>, _>(i))
        }
        "UUID" => wrap(
            row.try_get::<Option<Uuid>, _>(i)
                .map(|o| o.map(|u| u.to_string())),
        ),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(i)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => wrap(
            row.try_get::<Option<DateTime<Utc>>, _>(i)
                .map(|o| o.map(|t| t.to_rfc3339())),
        ),
        "TIMESTAMP" => wrap(
            row.try_get::<Option<NaiveDateTime>, _>(i)
                .map(|o| o.map(|t| t.to_string())),
        ),
        "DATE" => wrap(
            row.try_get::<Option<NaiveDate>, _>(i)
                .map(|o| o.map(|d| d.to_string())),
        ),
        // Exotic types (NUMERIC, intervals, ranges) decode as text when the
        // driver allows it, otherwise null.
        _ => row
            .try_get::<Option<String>, _>(i)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

struct QueryTool {
    db: Arc<Db>,
}

#[async_trait]
impl ToolHandler for QueryTool {
    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
        let sql = args
            .get("sql")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::internal("argument sql missing after validation"))?;
        verify_read_only(sql)?;

        let params = args
            .get("params")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut query = sqlx::query(sql);
        for param in &params {
            query = bind_value(query, param);
        }

        let (rows, truncated) = self.db.run(query).await?;
        Ok(json!({
            "rows": rows,
            "row_count": rows.len(),
            "truncated": truncated,
        }))
    }
}

const LIST_TABLES_SQL: &str = "SELECT table_name, table_type \
     FROM information_schema.tables WHERE table_schema = $1 ORDER BY table_name";

const LIST_COLUMNS_SQL: &str = "SELECT column_name, data_type, is_nullable, column_default \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position";

struct SchemaTool {
    db: Arc<Db>,
}

#[async_trait]
impl ToolHandler for SchemaTool {
    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
        let schema = args
            .get("schema")
            .and_then(|v| v.as_str())
            .unwrap_or("public")
            .to_string();
        let table = args.get("table").and_then(|v| v.as_str());

        match table {
            None => {
                let query = sqlx::query(LIST_TABLES_SQL).bind(schema.clone());
                let (rows, truncated) = self.db.run(query).await?;
                Ok(json!({
                    "schema": schema,
                    "tables": rows,
                    "truncated": truncated,
                }))
            }
            Some(table) => {
                let query = sqlx::query(LIST_COLUMNS_SQL)
                    .bind(schema.clone())
                    .bind(table.to_string());
                let (rows, truncated) = self.db.run(query).await?;
                Ok(json!({
                    "schema": schema,
                    "table": table,
                    "columns": rows,
                    "truncated": truncated,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgate_core::ErrorCode;

    fn expect_rejected(sql: &str, needle: &str) {
        let err = verify_read_only(sql).expect_err("must fail");
        assert_eq!(err.code, ErrorCode::SecurityError);
        assert!(
            err.message.contains(needle),
            "message {:?} should contain {:?}",
            err.message,
            needle
        );
    }

    #[test]
    fn accepts_plain_reads() {
        verify_read_only("SELECT 1").expect("select");
        verify_read_only("select id, name from users where id = $1").expect("lowercase");
        verify_read_only("WITH t AS (SELECT 1 AS x) SELECT * FROM t").expect("cte");
        verify_read_only("EXPLAIN SELECT * FROM users").expect("explain");
        verify_read_only("SELECT 1;").expect("trailing semicolon");
    }

    #[test]
    fn rejects_multi_statement_input() {
        expect_rejected("SELECT 1; DROP TABLE users", "multiple statements");
        expect_rejected("SELECT 1; SELECT 2", "multiple statements");
    }

    #[test]
    fn rejects_write_keywords_whole_word() {
        expect_rejected("DELETE FROM users", "DELETE");
        expect_rejected("SELECT 1; DELETE FROM users", "multiple statements");
        expect_rejected("EXPLAIN INSERT INTO t VALUES (1)", "INSERT");
        expect_rejected("SELECT * FROM t LOCK", "LOCK");
        // Substrings are fine: `updated_at` is not `UPDATE`.
        verify_read_only("SELECT updated_at, created_by FROM audit_events")
            .expect("substring keywords");
        verify_read_only("SELECT delete_count FROM stats").expect("substring keywords");
    }

    #[test]
    fn rejects_non_read_prefixes() {
        expect_rejected("VACUUM", "must start with");
        expect_rejected("SHOW search_path", "must start with");
    }

    #[test]
    fn rejects_dangerous_functions() {
        expect_rejected("SELECT pg_read_file('/etc/passwd')", "PG_READ_FILE");
        expect_rejected("SELECT lo_import('/etc/passwd')", "LO_IMPORT");
    }

    #[test]
    fn comments_do_not_hide_keywords() {
        expect_rejected("SELECT 1 /* sneaky */; DROP TABLE t", "multiple statements");
        expect_rejected("SELECT/*x*/1; DELETE FROM t -- gone", "multiple statements");
        verify_read_only("SELECT 1 -- DROP TABLE t").expect("comment-only keyword");
        verify_read_only("/* leading comment */ SELECT 1").expect("leading comment");
    }

    #[test]
    fn comment_stripping_is_bounded() {
        verify_read_only("SELECT 1 /* unterminated").expect("unterminated block comment");
        expect_rejected("-- only a comment", "empty");
    }

    #[test]
    fn set_and_copy_are_blocked() {
        expect_rejected("SET search_path TO public", "SET");
        expect_rejected("COPY users TO '/tmp/out'", "COPY");
    }
}
