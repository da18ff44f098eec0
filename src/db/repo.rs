use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::model::MonitorTrigger;
use super::{MonitorScheduler, ScheduleTaskRepository};
use crate::model::{OscParameters, Schedule, ScheduleTask, TaskParameters, TaskStatus};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("connect {normalized}"))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expands a leading `~/` in file-backed SQLite URLs and creates the parent
/// directory. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// SQLite backed schedule/task/trigger store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all)]
    pub async fn create_schedule(
        &self,
        connection_id: &str,
        parameters: &OscParameters,
    ) -> Result<i64> {
        let json = serde_json::to_string(parameters)?;
        let id: i64 = sqlx::query(
            "INSERT INTO schedules (connection_id, job_parameters) VALUES (?, ?) RETURNING id",
        )
        .bind(connection_id)
        .bind(json)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }

    #[instrument(skip_all, fields(schedule_id = schedule_id))]
    pub async fn create_task(&self, schedule_id: i64, parameters: &TaskParameters) -> Result<i64> {
        let json = serde_json::to_string(parameters)?;
        let id: i64 = sqlx::query(
            "INSERT INTO schedule_tasks (schedule_id, status, parameters) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(schedule_id)
        .bind(TaskStatus::Prepare.as_str())
        .bind(json)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(id)
    }

    /// Replaces the job parameters the next reconcile pass reads.
    #[instrument(skip_all, fields(schedule_id = schedule_id))]
    pub async fn update_job_parameters(
        &self,
        schedule_id: i64,
        parameters: &OscParameters,
    ) -> Result<()> {
        let json = serde_json::to_string(parameters)?;
        let updated = sqlx::query("UPDATE schedules SET job_parameters = ? WHERE id = ?")
            .bind(json)
            .bind(schedule_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(anyhow!("schedule {} not found", schedule_id));
        }
        Ok(())
    }

    pub async fn get_schedule(&self, schedule_id: i64) -> Result<Schedule> {
        let row = sqlx::query("SELECT id, connection_id, job_parameters FROM schedules WHERE id = ?")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(anyhow!("schedule {} not found", schedule_id));
        };
        let json: String = row.get("job_parameters");
        Ok(Schedule {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            job_parameters: serde_json::from_str(&json)
                .with_context(|| format!("schedule {schedule_id} has malformed parameters"))?,
        })
    }

    pub async fn get_task(&self, task_id: i64) -> Result<ScheduleTask> {
        let row = sqlx::query(
            "SELECT id, schedule_id, status, parameters, result_json, progress_percentage \
             FROM schedule_tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(anyhow!("schedule task {} not found", task_id));
        };
        task_from_row(&row)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduleTask>> {
        let rows = sqlx::query(
            "SELECT id, schedule_id, status, parameters, result_json, progress_percentage \
             FROM schedule_tasks ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }
}

fn task_from_row(row: &SqliteRow) -> Result<ScheduleTask> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    let parameters: String = row.get("parameters");
    Ok(ScheduleTask {
        id,
        schedule_id: row.get("schedule_id"),
        status: TaskStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("schedule task {} has unknown status {}", id, status))?,
        parameters: serde_json::from_str(&parameters)
            .with_context(|| format!("schedule task {id} has malformed parameters"))?,
        result_json: row.try_get::<Option<String>, _>("result_json").ok().flatten(),
        progress_percentage: row.get("progress_percentage"),
    })
}

#[async_trait]
impl ScheduleTaskRepository for SqliteStore {
    #[instrument(skip_all, fields(task_id = task_id))]
    async fn update_task_parameters(
        &self,
        task_id: i64,
        parameters: &TaskParameters,
    ) -> Result<()> {
        let json = serde_json::to_string(parameters)?;
        sqlx::query(
            "UPDATE schedule_tasks SET parameters = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(json)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = task_id, progress = progress))]
    async fn update_result(&self, task_id: i64, result_json: &str, progress: f64) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_tasks SET result_json = ?, progress_percentage = ?, \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(result_json)
        .bind(progress)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = task_id, status = status.as_str()))]
    async fn update_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_tasks SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MonitorScheduler for SqliteStore {
    async fn exists(&self, schedule_id: i64) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT schedule_id FROM monitor_triggers WHERE schedule_id = ?",
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    #[instrument(skip_all, fields(schedule_id = trigger.schedule_id))]
    async fn create(&self, trigger: &MonitorTrigger) -> Result<()> {
        let data = serde_json::to_string(trigger)?;
        sqlx::query(
            "INSERT INTO monitor_triggers (schedule_id, task_id, trigger_data, enabled) VALUES (?, ?, ?, 1)",
        )
        .bind(trigger.schedule_id)
        .bind(trigger.schedule_task_id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(schedule_id = trigger.schedule_id))]
    async fn refresh_trigger_data(&self, trigger: &MonitorTrigger) -> Result<()> {
        let data = serde_json::to_string(trigger)?;
        sqlx::query(
            "UPDATE monitor_triggers SET task_id = ?, trigger_data = ?, enabled = 1, \
             updated_at = CURRENT_TIMESTAMP WHERE schedule_id = ?",
        )
        .bind(trigger.schedule_task_id)
        .bind(data)
        .bind(trigger.schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(schedule_id = schedule_id))]
    async fn disable(&self, schedule_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE monitor_triggers SET enabled = 0, updated_at = CURRENT_TIMESTAMP WHERE schedule_id = ?",
        )
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn armed(&self) -> Result<Vec<MonitorTrigger>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT trigger_data FROM monitor_triggers WHERE enabled = 1 ORDER BY created_at, schedule_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|data| serde_json::from_str(data).context("malformed trigger data"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RateLimiterConfig, SwapTableType};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn params() -> OscParameters {
        OscParameters {
            database_name: "db".into(),
            table_name: "orders".into(),
            alter_clause: "ADD COLUMN note VARCHAR(64)".into(),
            swap_table_type: SwapTableType::Manual,
            lock_users: vec!["app".into()],
            rate_limit_config: RateLimiterConfig {
                row_limit: Some(100),
                data_size_limit: None,
            },
            origin_table_clean_strategy: Default::default(),
            swap_table_name_retry_times: 3,
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("mysql://x/y"), "mysql://x/y");
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}/nested/osc.db?mode=rwc", td.path().display());
        let out = prepare_sqlite_url(&url);
        assert!(out.starts_with("sqlite://"));
        assert!(out.ends_with("/nested/osc.db?mode=rwc"));
        assert!(td.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn schedule_and_task_round_trip() {
        let store = setup_store().await;
        let schedule_id = store.create_schedule("ob-mysql", &params()).await.unwrap();
        let schedule = store.get_schedule(schedule_id).await.unwrap();
        assert_eq!(schedule.job_parameters, params());

        let mut tp = TaskParameters {
            database_name: "db".into(),
            origin_table_name: "orders".into(),
            ..Default::default()
        };
        let task_id = store.create_task(schedule_id, &tp).await.unwrap();
        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Prepare);
        assert!(task.result_json.is_none());

        tp.oms_project_id = Some("p-1".into());
        store.update_task_parameters(task_id, &tp).await.unwrap();
        store.update_result(task_id, "{}", 42.5).await.unwrap();
        store.update_status(task_id, TaskStatus::Running).await.unwrap();

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.parameters.oms_project_id.as_deref(), Some("p-1"));
        assert_eq!(task.progress_percentage, 42.5);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_parameters_can_be_replaced() {
        let store = setup_store().await;
        let schedule_id = store.create_schedule("ob-mysql", &params()).await.unwrap();

        let mut changed = params();
        changed.rate_limit_config.data_size_limit = Some(2048);
        store.update_job_parameters(schedule_id, &changed).await.unwrap();

        let schedule = store.get_schedule(schedule_id).await.unwrap();
        assert_eq!(schedule.job_parameters, changed);
        assert!(store.update_job_parameters(schedule_id + 1, &changed).await.is_err());
    }

    #[tokio::test]
    async fn trigger_lifecycle() {
        let store = setup_store().await;
        let schedule_id = store.create_schedule("ob-mysql", &params()).await.unwrap();
        let task_id = store
            .create_task(schedule_id, &TaskParameters::default())
            .await
            .unwrap();
        let mut trigger = MonitorTrigger {
            schedule_id,
            schedule_task_id: task_id,
            oms_project_id: None,
        };

        assert!(!store.exists(schedule_id).await.unwrap());
        store.create(&trigger).await.unwrap();
        assert!(store.exists(schedule_id).await.unwrap());

        trigger.oms_project_id = Some("p-9".into());
        store.refresh_trigger_data(&trigger).await.unwrap();
        assert_eq!(store.armed().await.unwrap(), vec![trigger.clone()]);

        store.disable(schedule_id).await.unwrap();
        assert!(store.armed().await.unwrap().is_empty());
        assert!(store.exists(schedule_id).await.unwrap());

        // refresh re-arms a disabled trigger
        store.refresh_trigger_data(&trigger).await.unwrap();
        assert_eq!(store.armed().await.unwrap().len(), 1);
    }
}
