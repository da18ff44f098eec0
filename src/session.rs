//! Sessions against the target database.
//!
//! The stages only use the traits; `MySqlSessionFactory` is the real thing,
//! talking to OceanBase through its MySQL protocol endpoint.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{ConnectionConfig, DialectType};

/// One connection, optionally bound to a schema. Callers must `close` it.
#[async_trait]
pub trait DbSession: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// First row's value of `column` (matched case-insensitively), if any row.
    async fn query_single_value(&mut self, sql: &str, column: &str) -> Result<Option<String>>;

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool>;

    /// Column names of `schema.table` in definition order.
    async fn list_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Evicts sessions belonging to given accounts.
#[async_trait]
pub trait SessionAdmin: Send + Sync {
    /// Returns how many sessions were killed.
    async fn kill_sessions_of_users(&self, users: &[String]) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DbSession>>;

    async fn open_admin(&self, config: &ConnectionConfig) -> Result<Arc<dyn SessionAdmin>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSessionFactory;

impl MySqlSessionFactory {
    async fn connect(config: &ConnectionConfig, schema: Option<&str>) -> Result<MySqlConnection> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.login_user());
        if let Some(password) = config.password.as_deref() {
            options = options.password(password);
        }
        if let Some(schema) = schema {
            options = options.database(schema);
        }
        options
            .connect()
            .await
            .with_context(|| format!("connect to {} ({}:{})", config.id, config.host, config.port))
    }
}

#[async_trait]
impl SessionFactory for MySqlSessionFactory {
    async fn open(
        &self,
        config: &ConnectionConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DbSession>> {
        let conn = Self::connect(config, schema).await?;
        debug!(connection = %config.id, ?schema, "session opened");
        Ok(Box::new(MySqlSession {
            conn,
            dialect: config.dialect,
        }))
    }

    async fn open_admin(&self, config: &ConnectionConfig) -> Result<Arc<dyn SessionAdmin>> {
        let conn = Self::connect(config, None).await?;
        Ok(Arc::new(MySqlSessionAdmin {
            conn: Mutex::new(Some(conn)),
        }))
    }
}

pub struct MySqlSession {
    conn: MySqlConnection,
    dialect: DialectType,
}

#[async_trait]
impl DbSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "execute");
        self.conn
            .execute(sql)
            .await
            .with_context(|| format!("execute `{sql}`"))?;
        Ok(())
    }

    async fn query_single_value(&mut self, sql: &str, column: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .fetch_optional(sql)
            .await
            .with_context(|| format!("query `{sql}`"))?;
        match row {
            Some(row) => column_value(&row, column),
            None => Ok(None),
        }
    }

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool> {
        let sql = if self.dialect.is_oracle() {
            "SELECT COUNT(1) FROM ALL_TABLES WHERE OWNER = ? AND TABLE_NAME = ?"
        } else {
            "SELECT COUNT(1) FROM information_schema.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?"
        };
        let row = sqlx::query(sql)
            .bind(schema)
            .bind(table)
            .fetch_one(&mut self.conn)
            .await
            .with_context(|| format!("look up table {schema}.{table}"))?;
        let count = int_value(&row, 0)?;
        Ok(count > 0)
    }

    async fn list_columns(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let sql = if self.dialect.is_oracle() {
            "SELECT COLUMN_NAME FROM ALL_TAB_COLUMNS WHERE OWNER = ? AND TABLE_NAME = ? \
             ORDER BY COLUMN_ID"
        } else {
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION"
        };
        let rows = sqlx::query(sql)
            .bind(schema)
            .bind(table)
            .fetch_all(&mut self.conn)
            .await
            .with_context(|| format!("list columns of {schema}.{table}"))?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = column_value(row, "column_name")? {
                columns.push(name);
            }
        }
        Ok(columns)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

pub struct MySqlSessionAdmin {
    conn: Mutex<Option<MySqlConnection>>,
}

#[async_trait]
impl SessionAdmin for MySqlSessionAdmin {
    async fn kill_sessions_of_users(&self, users: &[String]) -> Result<usize> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow!("admin session already closed"))?;
        let rows = conn.fetch_all("SHOW FULL PROCESSLIST").await?;
        let mut victims = Vec::new();
        for row in &rows {
            let Some(user) = column_value(row, "user")? else {
                continue;
            };
            if users.iter().any(|u| u.eq_ignore_ascii_case(&user)) {
                victims.push(int_value(row, 0)?);
            }
        }
        for id in &victims {
            // the session may already be gone
            if let Err(err) = conn.execute(format!("KILL {id}").as_str()).await {
                debug!(id, ?err, "kill session failed");
            }
        }
        if !victims.is_empty() {
            info!(killed = victims.len(), "evicted lock user sessions");
        }
        Ok(victims.len())
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

fn column_value(row: &MySqlRow, column: &str) -> Result<Option<String>> {
    let idx = row
        .columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(column))
        .ok_or_else(|| anyhow!("column {column} not in result"))?;
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(|v| v.to_string()));
    }
    let v = row.try_get::<Option<u64>, _>(idx)?;
    Ok(v.map(|v| v.to_string()))
}

fn int_value(row: &MySqlRow, idx: usize) -> Result<i64> {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<u64, _>(idx) {
        return i64::try_from(v).context("integer out of range");
    }
    let text: String = row.try_get(idx)?;
    text.trim()
        .parse()
        .with_context(|| format!("not an integer: {text}"))
}
