//! Rename based table swap.
//!
//! The origin table is renamed away and the shadow table takes its name. The
//! swap only runs once the catch-up probe confirms replication is current.

use anyhow::anyhow;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::OscError;
use crate::model::{DialectType, OriginTableCleanStrategy};
use crate::session::DbSession;

// lets a lock wait on the tables clear before the next attempt
pub const RENAME_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped,
    /// The tables were already in their final place.
    AlreadySwapped,
    /// Replication did not catch up in time; nothing was renamed.
    NotCaughtUp,
}

/// Proof that incremental replication caught up with the origin table.
#[async_trait]
pub trait CatchUpProbe: Send + Sync {
    async fn caught_up(&self) -> Result<bool, OscError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTables {
    pub schema: String,
    pub origin: String,
    pub new: String,
    pub renamed: String,
}

#[derive(Debug, Clone)]
pub struct TableSwapper {
    dialect: DialectType,
    retry_times: u32,
    clean_strategy: OriginTableCleanStrategy,
}

impl TableSwapper {
    pub fn new(
        dialect: DialectType,
        retry_times: u32,
        clean_strategy: OriginTableCleanStrategy,
    ) -> Self {
        Self {
            dialect,
            retry_times: retry_times.max(1),
            clean_strategy,
        }
    }

    pub async fn swap(
        &self,
        session: &mut dyn DbSession,
        tables: &SwapTables,
        probe: &dyn CatchUpProbe,
    ) -> Result<SwapOutcome, OscError> {
        let schema = tables.schema.as_str();
        let new_exists = session.table_exists(schema, &tables.new).await?;
        let renamed_exists = session.table_exists(schema, &tables.renamed).await?;
        let origin_exists = session.table_exists(schema, &tables.origin).await?;

        match (new_exists, origin_exists, renamed_exists) {
            (false, _, true) => {
                info!(table = %tables.origin, "tables already swapped");
                return Ok(SwapOutcome::AlreadySwapped);
            }
            (false, _, false) => {
                return Err(anyhow!("shadow table {} not found", tables.new).into());
            }
            (true, true, true) => {
                return Err(anyhow!(
                    "{} already exists, drop it before swapping",
                    tables.renamed
                )
                .into());
            }
            (true, false, false) => {
                return Err(anyhow!("origin table {} not found", tables.origin).into());
            }
            (true, false, true) => {
                // an earlier attempt stopped halfway; only the shadow rename is left
                warn!(table = %tables.origin, "finishing interrupted swap");
                let sql = self.rename_sql(&tables.new, &tables.origin);
                self.execute_with_retry(session, &sql).await?;
                self.clean(session, tables).await;
                return Ok(SwapOutcome::Swapped);
            }
            (true, true, false) => {}
        }

        if !probe.caught_up().await? {
            warn!(table = %tables.origin, "replication not caught up, swap skipped");
            return Ok(SwapOutcome::NotCaughtUp);
        }

        match self.dialect {
            DialectType::ObMysql => {
                let sql = format!(
                    "RENAME TABLE {} TO {}, {} TO {}",
                    self.quote(&tables.origin),
                    self.quote(&tables.renamed),
                    self.quote(&tables.new),
                    self.quote(&tables.origin)
                );
                self.execute_with_retry(session, &sql).await?;
            }
            DialectType::ObOracle => self.swap_sequentially(session, tables).await?,
        }
        info!(
            origin = %tables.origin,
            renamed = %tables.renamed,
            new = %tables.new,
            "tables swapped"
        );
        self.clean(session, tables).await;
        Ok(SwapOutcome::Swapped)
    }

    async fn swap_sequentially(
        &self,
        session: &mut dyn DbSession,
        tables: &SwapTables,
    ) -> Result<(), OscError> {
        let away = self.rename_sql(&tables.origin, &tables.renamed);
        self.execute_with_retry(session, &away).await?;
        let into_place = self.rename_sql(&tables.new, &tables.origin);
        if let Err(err) = self.execute_with_retry(session, &into_place).await {
            let back = self.rename_sql(&tables.renamed, &tables.origin);
            if let Err(rollback) = session.execute(&back).await {
                warn!(?rollback, "failed to restore origin table name");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn clean(&self, session: &mut dyn DbSession, tables: &SwapTables) {
        if self.clean_strategy != OriginTableCleanStrategy::OriginTableDrop {
            return;
        }
        let sql = format!("DROP TABLE {}", self.quote(&tables.renamed));
        match session.execute(&sql).await {
            Ok(()) => info!(table = %tables.renamed, "origin table dropped"),
            Err(err) => warn!(table = %tables.renamed, ?err, "failed to drop origin table"),
        }
    }

    fn rename_sql(&self, from: &str, to: &str) -> String {
        match self.dialect {
            DialectType::ObMysql => {
                format!("RENAME TABLE {} TO {}", self.quote(from), self.quote(to))
            }
            DialectType::ObOracle => {
                format!("ALTER TABLE {} RENAME TO {}", self.quote(from), self.quote(to))
            }
        }
    }

    fn quote(&self, name: &str) -> String {
        quote_identifier(self.dialect, name)
    }

    async fn execute_with_retry(
        &self,
        session: &mut dyn DbSession,
        sql: &str,
    ) -> Result<(), OscError> {
        let mut attempt = 1;
        loop {
            match session.execute(sql).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retry_times => {
                    warn!(attempt, ?err, "rename failed, retrying");
                    tokio::time::sleep(RENAME_RETRY_PAUSE).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub fn quote_identifier(dialect: DialectType, name: &str) -> String {
    match dialect {
        DialectType::ObMysql => format!("`{}`", name.replace('`', "``")),
        DialectType::ObOracle => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeSession {
        tables: HashSet<String>,
        executed: Vec<String>,
        fail_first: usize,
    }

    #[async_trait]
    impl DbSession for FakeSession {
        async fn execute(&mut self, sql: &str) -> anyhow::Result<()> {
            self.executed.push(sql.to_string());
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return Err(anyhow!("lock wait timeout"));
            }
            Ok(())
        }

        async fn query_single_value(
            &mut self,
            _sql: &str,
            _column: &str,
        ) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn table_exists(&mut self, _schema: &str, table: &str) -> anyhow::Result<bool> {
            Ok(self.tables.contains(table))
        }

        async fn list_columns(
            &mut self,
            _schema: &str,
            _table: &str,
        ) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }

        async fn close(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Probe(bool);

    #[async_trait]
    impl CatchUpProbe for Probe {
        async fn caught_up(&self) -> Result<bool, OscError> {
            Ok(self.0)
        }
    }

    fn tables() -> SwapTables {
        SwapTables {
            schema: "db".into(),
            origin: "orders".into(),
            new: "_orders_osc_new_".into(),
            renamed: "_orders_osc_old_".into(),
        }
    }

    fn session_with(names: &[&str]) -> FakeSession {
        FakeSession {
            tables: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mysql_swap_is_one_statement() {
        let mut s = session_with(&["orders", "_orders_osc_new_"]);
        let swapper = TableSwapper::new(DialectType::ObMysql, 3, Default::default());
        let out = swapper.swap(&mut s, &tables(), &Probe(true)).await.unwrap();
        assert_eq!(out, SwapOutcome::Swapped);
        assert_eq!(
            s.executed,
            vec!["RENAME TABLE `orders` TO `_orders_osc_old_`, `_orders_osc_new_` TO `orders`"]
        );
    }

    #[tokio::test]
    async fn not_caught_up_never_renames() {
        let mut s = session_with(&["orders", "_orders_osc_new_"]);
        let swapper = TableSwapper::new(DialectType::ObMysql, 3, Default::default());
        let out = swapper.swap(&mut s, &tables(), &Probe(false)).await.unwrap();
        assert_eq!(out, SwapOutcome::NotCaughtUp);
        assert!(s.executed.is_empty());
    }

    #[tokio::test]
    async fn already_swapped_is_a_no_op() {
        let mut s = session_with(&["orders", "_orders_osc_old_"]);
        let swapper = TableSwapper::new(DialectType::ObMysql, 1, Default::default());
        let out = swapper.swap(&mut s, &tables(), &Probe(true)).await.unwrap();
        assert_eq!(out, SwapOutcome::AlreadySwapped);
        assert!(s.executed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_drops_origin() {
        let started = tokio::time::Instant::now();
        let mut s = session_with(&["orders", "_orders_osc_new_"]);
        s.fail_first = 2;
        let swapper = TableSwapper::new(
            DialectType::ObMysql,
            3,
            OriginTableCleanStrategy::OriginTableDrop,
        );
        let out = swapper.swap(&mut s, &tables(), &Probe(true)).await.unwrap();
        assert_eq!(out, SwapOutcome::Swapped);
        assert_eq!(s.executed.len(), 4);
        assert_eq!(s.executed[3], "DROP TABLE `_orders_osc_old_`");
        assert!(started.elapsed() >= RENAME_RETRY_PAUSE * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let mut s = session_with(&["orders", "_orders_osc_new_"]);
        s.fail_first = 5;
        let swapper = TableSwapper::new(DialectType::ObMysql, 2, Default::default());
        let err = swapper.swap(&mut s, &tables(), &Probe(true)).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(s.executed.len(), 2);
    }

    #[tokio::test]
    async fn oracle_renames_sequentially() {
        let mut s = session_with(&["orders", "_orders_osc_new_"]);
        let swapper = TableSwapper::new(DialectType::ObOracle, 1, Default::default());
        swapper.swap(&mut s, &tables(), &Probe(true)).await.unwrap();
        assert_eq!(
            s.executed,
            vec![
                r#"ALTER TABLE "orders" RENAME TO "_orders_osc_old_""#,
                r#"ALTER TABLE "_orders_osc_new_" RENAME TO "orders""#,
            ]
        );
    }

    #[tokio::test]
    async fn interrupted_swap_is_finished_without_probe() {
        let mut s = session_with(&["_orders_osc_old_", "_orders_osc_new_"]);
        let swapper = TableSwapper::new(DialectType::ObMysql, 1, Default::default());
        let out = swapper.swap(&mut s, &tables(), &Probe(false)).await.unwrap();
        assert_eq!(out, SwapOutcome::Swapped);
        assert_eq!(s.executed, vec!["RENAME TABLE `_orders_osc_new_` TO `orders`"]);
    }

    #[tokio::test]
    async fn leftover_renamed_table_is_an_error() {
        let mut s = session_with(&["orders", "_orders_osc_new_", "_orders_osc_old_"]);
        let swapper = TableSwapper::new(DialectType::ObMysql, 1, Default::default());
        assert!(swapper.swap(&mut s, &tables(), &Probe(true)).await.is_err());
        assert!(s.executed.is_empty());
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_identifier(DialectType::ObMysql, "a`b"), "`a``b`");
        assert_eq!(quote_identifier(DialectType::ObOracle, "T"), "\"T\"");
    }
}
