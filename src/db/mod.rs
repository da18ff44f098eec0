//! Persistence of schedules, schedule tasks and monitor triggers.
//!
//! - `model`: row views returned by the store.
//! - `repo`: the SQLite implementation of the traits below.
//!
//! The pipeline only sees the two traits, so tests can swap in recording
//! fakes without a database.

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{TaskParameters, TaskStatus};

pub mod model;
pub mod repo;

pub use model::MonitorTrigger;
pub use repo::{init_pool, run_migrations, Pool, SqliteStore};

/// Writes the pipeline performs on a schedule task.
#[async_trait]
pub trait ScheduleTaskRepository: Send + Sync {
    async fn update_task_parameters(&self, task_id: i64, parameters: &TaskParameters)
        -> Result<()>;

    async fn update_result(&self, task_id: i64, result_json: &str, progress: f64) -> Result<()>;

    async fn update_status(&self, task_id: i64, status: TaskStatus) -> Result<()>;
}

/// Arms and disarms the periodic trigger that polls a schedule's task.
#[async_trait]
pub trait MonitorScheduler: Send + Sync {
    async fn exists(&self, schedule_id: i64) -> Result<bool>;

    async fn create(&self, trigger: &MonitorTrigger) -> Result<()>;

    async fn refresh_trigger_data(&self, trigger: &MonitorTrigger) -> Result<()>;

    async fn disable(&self, schedule_id: i64) -> Result<()>;

    /// Enabled triggers, oldest first.
    async fn armed(&self) -> Result<Vec<MonitorTrigger>>;
}
