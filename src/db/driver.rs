//! Dialect-neutral query driver
//!
//! Repositories write SQL once with `?` positional placeholders. The driver
//! rewrites them to `$n` for PostgreSQL and passes them through to SQLite,
//! binds a small parameter enum on either backend, and returns rows in a
//! backend-neutral shape. SQLite work runs on the blocking pool.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use tokio_postgres::types::{ToSql, Type};
use tracing::info;

use super::pool::{DbError, DbPool};

/// A positional query parameter. Every variant is nullable so that typed
/// NULLs bind cleanly on the PostgreSQL side.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(Some(v))
    }
}

impl From<&String> for SqlParam {
    fn from(v: &String) -> Self {
        SqlParam::Text(Some(v.clone()))
    }
}

impl From<Option<String>> for SqlParam {
    fn from(v: Option<String>) -> Self {
        SqlParam::Text(v)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(Some(v))
    }
}

impl From<Option<i64>> for SqlParam {
    fn from(v: Option<i64>) -> Self {
        SqlParam::Int(v)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        SqlParam::Float(Some(v))
    }
}

impl From<Option<f64>> for SqlParam {
    fn from(v: Option<f64>) -> Self {
        SqlParam::Float(v)
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        SqlParam::Bool(Some(v))
    }
}

/// Build a `Vec<SqlParam>` from mixed native values.
#[macro_export]
macro_rules! sql_params {
    ($($p:expr),* $(,)?) => {
        vec![$($crate::db::driver::SqlParam::from($p)),*]
    };
}

/// A single column value read back from either backend.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

/// A backend-neutral result row with typed, name-keyed getters.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    fn index(&self, name: &str) -> Result<usize, DbError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DbError::Decode(format!("no such column: {}", name)))
    }

    fn value(&self, name: &str) -> Result<&SqlValue, DbError> {
        let idx = self.index(name)?;
        Ok(&self.values[idx])
    }

    pub fn get_string(&self, name: &str) -> Result<String, DbError> {
        self.get_opt_string(name)?
            .ok_or_else(|| DbError::Decode(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_string(&self, name: &str) -> Result<Option<String>, DbError> {
        match self.value(name)? {
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Null => Ok(None),
            other => Err(DbError::Decode(format!(
                "column {} is not text: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, DbError> {
        self.get_opt_i64(name)?
            .ok_or_else(|| DbError::Decode(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_i64(&self, name: &str) -> Result<Option<i64>, DbError> {
        match self.value(name)? {
            SqlValue::Int(v) => Ok(Some(*v)),
            SqlValue::Null => Ok(None),
            other => Err(DbError::Decode(format!(
                "column {} is not an integer: {:?}",
                name, other
            ))),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, DbError> {
        self.get_opt_f64(name)?
            .ok_or_else(|| DbError::Decode(format!("unexpected NULL in column {}", name)))
    }

    pub fn get_opt_f64(&self, name: &str) -> Result<Option<f64>, DbError> {
        match self.value(name)? {
            SqlValue::Float(v) => Ok(Some(*v)),
            // SUM() over an integer column comes back as an integer
            SqlValue::Int(v) => Ok(Some(*v as f64)),
            SqlValue::Null => Ok(None),
            other => Err(DbError::Decode(format!(
                "column {} is not a float: {:?}",
                name, other
            ))),
        }
    }
}

/// Shared handle to the embedded SQLite backend.
#[derive(Clone)]
pub struct SqliteDb {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteDb {
    pub fn open(path: &str) -> Result<Self, DbError> {
        let conn = if path == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(path)?
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if path != ":memory:" {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        info!(path = %path, "SQLite database opened");
        Ok(SqliteDb {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// The persistence handle shared by all repositories.
#[derive(Clone)]
pub enum Db {
    Postgres(DbPool),
    Sqlite(SqliteDb),
}

impl Db {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Db::Postgres(_) => "postgres",
            Db::Sqlite(_) => "sqlite",
        }
    }

    /// Run a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: Vec<SqlParam>) -> Result<u64, DbError> {
        match self {
            Db::Postgres(pool) => {
                let client = pool.get().await?;
                let sql = rewrite_placeholders(sql);
                let refs = pg_params(&params);
                Ok(client.execute(sql.as_str(), &refs).await?)
            }
            Db::Sqlite(db) => {
                let conn = db.conn.clone();
                let sql = sql.to_string();
                tokio::task::spawn_blocking(move || -> Result<u64, DbError> {
                    let conn = conn.lock();
                    let refs = sqlite_params(&params);
                    let n = conn.execute(&sql, &refs[..])?;
                    Ok(n as u64)
                })
                .await?
            }
        }
    }

    /// Run a query, returning all rows.
    pub async fn query(&self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<SqlRow>, DbError> {
        match self {
            Db::Postgres(pool) => {
                let client = pool.get().await?;
                let sql = rewrite_placeholders(sql);
                let refs = pg_params(&params);
                let rows = client.query(sql.as_str(), &refs).await?;
                rows.iter().map(pg_row).collect()
            }
            Db::Sqlite(db) => {
                let conn = db.conn.clone();
                let sql = sql.to_string();
                tokio::task::spawn_blocking(move || -> Result<Vec<SqlRow>, DbError> {
                    let conn = conn.lock();
                    let mut stmt = conn.prepare(&sql)?;
                    let columns: Arc<Vec<String>> = Arc::new(
                        stmt.column_names().iter().map(|s| s.to_string()).collect(),
                    );
                    let refs = sqlite_params(&params);
                    let mut rows = stmt.query(&refs[..])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        let mut values = Vec::with_capacity(columns.len());
                        for i in 0..columns.len() {
                            values.push(sqlite_value(row.get_ref(i)?));
                        }
                        out.push(SqlRow {
                            columns: columns.clone(),
                            values,
                        });
                    }
                    Ok(out)
                })
                .await?
            }
        }
    }

    /// Run a query expected to produce zero or one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
    ) -> Result<Option<SqlRow>, DbError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a query expected to produce exactly one row.
    pub async fn query_one(&self, sql: &str, params: Vec<SqlParam>) -> Result<SqlRow, DbError> {
        self.query_opt(sql, params)
            .await?
            .ok_or_else(|| DbError::Decode("query returned no rows".to_string()))
    }

    /// Run a sequence of statements atomically in a single transaction.
    pub async fn execute_tx(
        &self,
        statements: Vec<(String, Vec<SqlParam>)>,
    ) -> Result<(), DbError> {
        match self {
            Db::Postgres(pool) => {
                let mut client = pool.get().await?;
                let tx = client.transaction().await?;
                for (sql, params) in &statements {
                    let sql = rewrite_placeholders(sql);
                    let refs = pg_params(params);
                    tx.execute(sql.as_str(), &refs).await?;
                }
                tx.commit().await?;
                Ok(())
            }
            Db::Sqlite(db) => {
                let conn = db.conn.clone();
                tokio::task::spawn_blocking(move || -> Result<(), DbError> {
                    let mut conn = conn.lock();
                    let tx = conn.transaction()?;
                    for (sql, params) in &statements {
                        let refs = sqlite_params(params);
                        tx.execute(sql, &refs[..])?;
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?
            }
        }
    }

    /// Cheap connectivity probe for the readiness endpoint.
    pub async fn ping(&self) -> Result<(), DbError> {
        match self {
            Db::Postgres(pool) => pool.test_connection().await,
            Db::Sqlite(_) => {
                self.query_one("SELECT 1 AS one", vec![]).await?;
                Ok(())
            }
        }
    }
}

/// Rewrite `?` placeholders to `$1..$n` for the PostgreSQL dialect.
/// Question marks inside quoted literals are left alone.
fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_quote = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                out.push(ch);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

fn pg_params(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| match p {
            SqlParam::Text(v) => v as &(dyn ToSql + Sync),
            SqlParam::Int(v) => v as &(dyn ToSql + Sync),
            SqlParam::Float(v) => v as &(dyn ToSql + Sync),
            SqlParam::Bool(v) => v as &(dyn ToSql + Sync),
        })
        .collect()
}

fn sqlite_params(params: &[SqlParam]) -> Vec<&dyn rusqlite::ToSql> {
    params
        .iter()
        .map(|p| match p {
            SqlParam::Text(v) => v as &dyn rusqlite::ToSql,
            SqlParam::Int(v) => v as &dyn rusqlite::ToSql,
            SqlParam::Float(v) => v as &dyn rusqlite::ToSql,
            SqlParam::Bool(v) => v as &dyn rusqlite::ToSql,
        })
        .collect()
}

fn sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Float(v),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => SqlValue::Null,
    }
}

fn pg_row(row: &tokio_postgres::Row) -> Result<SqlRow, DbError> {
    let columns: Arc<Vec<String>> = Arc::new(
        row.columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
    );
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = match *col.type_() {
            Type::INT8 => row
                .try_get::<_, Option<i64>>(i)?
                .map_or(SqlValue::Null, SqlValue::Int),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)?
                .map_or(SqlValue::Null, |v| SqlValue::Int(v as i64)),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(i)?
                .map_or(SqlValue::Null, SqlValue::Float),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)?
                .map_or(SqlValue::Null, |v| SqlValue::Float(v as f64)),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)?
                .map_or(SqlValue::Null, SqlValue::Bool),
            _ => row
                .try_get::<_, Option<String>>(i)?
                .map_or(SqlValue::Null, SqlValue::Text),
        };
        values.push(value);
    }
    Ok(SqlRow { columns, values })
}
