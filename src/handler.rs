//! Job level entry points: submit a change, tick a running job, approve a
//! manual swap, change its rate limit, read its state.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OscProperties;
use crate::db::{MonitorScheduler, MonitorTrigger, ScheduleTaskRepository, SqliteStore};
use crate::error::OscError;
use crate::model::{
    ConnectionConfig, DialectType, OscParameters, RateLimiterConfig, ScheduleTask,
    ScheduleTaskResult, TaskParameters, TaskStatus,
};
use crate::oms::model::{ProjectControlRequest, ProjectStatus};
use crate::oms::MigrationApi;
use crate::pipeline::check_project::CheckProjectStage;
use crate::pipeline::create_project::{CreateProjectStage, ProjectRequestStrategy};
use crate::pipeline::swap_table::SwapTableStage;
use crate::pipeline::{CompletionHandler, OscContext, Pipeline};
use crate::rename::quote_identifier;
use crate::session::{DbSession, SessionFactory};

static IDENTIFIER: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$"));

// longest table name whose shadow names still fit in 64 characters
const MAX_TABLE_NAME_LEN: usize = 64 - "__osc_new_".len();

/// Resolves the connection a schedule runs against.
pub trait ConnectionProvider: Send + Sync {
    fn connection(&self, id: &str) -> anyhow::Result<ConnectionConfig>;
}

/// Connections listed in the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredConnections {
    connections: HashMap<String, ConnectionConfig>,
}

impl ConfiguredConnections {
    pub fn new(connections: Vec<ConnectionConfig>) -> Self {
        Self {
            connections: connections.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

impl ConnectionProvider for ConfiguredConnections {
    fn connection(&self, id: &str) -> anyhow::Result<ConnectionConfig> {
        self.connections
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown connection {}", id))
    }
}

/// Marks the task done, stops polling it and releases the migration project.
pub struct RepositoryCompletionHandler {
    repository: Arc<dyn ScheduleTaskRepository>,
    monitor: Arc<dyn MonitorScheduler>,
    api: Arc<dyn MigrationApi>,
}

impl RepositoryCompletionHandler {
    pub fn new(
        repository: Arc<dyn ScheduleTaskRepository>,
        monitor: Arc<dyn MonitorScheduler>,
        api: Arc<dyn MigrationApi>,
    ) -> Self {
        Self {
            repository,
            monitor,
            api,
        }
    }
}

#[async_trait]
impl CompletionHandler for RepositoryCompletionHandler {
    async fn on_complete(&self, ctx: &OscContext) -> Result<(), OscError> {
        let task_id = ctx.schedule_task.id;
        let json = ctx.schedule_task.result_json.as_deref().unwrap_or("{}");
        self.repository
            .update_result(task_id, json, 100.0)
            .await
            .map_err(OscError::storage)?;
        self.repository
            .update_status(task_id, TaskStatus::Done)
            .await
            .map_err(OscError::storage)?;
        self.monitor
            .disable(ctx.schedule.id)
            .await
            .map_err(OscError::storage)?;
        info!(task_id, schedule_id = ctx.schedule.id, "schema change completed");
        release_project(self.api.as_ref(), &ctx.task_parameters).await;
        Ok(())
    }
}

/// Stops the migration project if it still runs, then releases it. The task
/// outcome is already recorded, so failures are only logged.
pub async fn release_project(api: &dyn MigrationApi, tp: &TaskParameters) {
    let Some(id) = tp.oms_project_id.clone().filter(|id| !id.trim().is_empty()) else {
        return;
    };
    let control = ProjectControlRequest {
        id,
        uid: tp.uid.clone(),
    };
    match api.describe_project_progress(&control).await {
        Ok(progress) if progress.status.is_destroyed() => {
            debug!(project_id = %control.id, status = ?progress.status, "project already gone");
            return;
        }
        Ok(progress) if progress.status == ProjectStatus::Running => {
            if let Err(err) = api.stop_project(&control).await {
                warn!(project_id = %control.id, %err, "stop project before release failed");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(project_id = %control.id, %err, "describe project before release failed"),
    }
    match api.release_project(&control).await {
        Ok(()) => info!(project_id = %control.id, "migration project released"),
        Err(err) => warn!(project_id = %control.id, %err, "release project failed"),
    }
}

pub struct OscTaskHandler {
    store: Arc<SqliteStore>,
    api: Arc<dyn MigrationApi>,
    sessions: Arc<dyn SessionFactory>,
    connections: Arc<dyn ConnectionProvider>,
    strategy: Arc<dyn ProjectRequestStrategy>,
    properties: OscProperties,
}

impl OscTaskHandler {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn MigrationApi>,
        sessions: Arc<dyn SessionFactory>,
        connections: Arc<dyn ConnectionProvider>,
        strategy: Arc<dyn ProjectRequestStrategy>,
        properties: OscProperties,
    ) -> Self {
        Self {
            store,
            api,
            sessions,
            connections,
            strategy,
            properties,
        }
    }

    fn repository(&self) -> Arc<dyn ScheduleTaskRepository> {
        self.store.clone()
    }

    fn monitor(&self) -> Arc<dyn MonitorScheduler> {
        self.store.clone()
    }

    pub fn bootstrap_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.set_basic(Arc::new(CreateProjectStage::new(
            self.api.clone(),
            self.repository(),
            self.monitor(),
            self.sessions.clone(),
            self.strategy.clone(),
        )));
        pipeline
    }

    pub fn check_pipeline(&self) -> Pipeline {
        let completion = Arc::new(RepositoryCompletionHandler::new(
            self.repository(),
            self.monitor(),
            self.api.clone(),
        ));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_stage(Arc::new(CheckProjectStage::new(
                self.api.clone(),
                self.repository(),
                self.properties.clone(),
            )))
            .set_basic(Arc::new(SwapTableStage::new(
                self.api.clone(),
                self.sessions.clone(),
                completion,
                self.properties.clone(),
            )));
        pipeline
    }

    /// Registers a schema change on `connection_id`, prepares the shadow table
    /// and bootstraps the migration project.
    #[instrument(skip_all, fields(connection_id = connection_id))]
    pub async fn submit(
        &self,
        connection_id: &str,
        parameters: OscParameters,
    ) -> Result<ScheduleTask, OscError> {
        validate_parameters(&parameters)?;
        let connection = self.connections.connection(connection_id)?;

        let schedule_id = self
            .store
            .create_schedule(connection_id, &parameters)
            .await
            .map_err(OscError::storage)?;
        let task_parameters = task_parameters_for(&parameters);
        let task_id = self
            .store
            .create_task(schedule_id, &task_parameters)
            .await
            .map_err(OscError::storage)?;
        info!(schedule_id, task_id, table = %parameters.table_name, "schema change submitted");

        let mut ctx = self.load_context(task_id).await?;
        let prepared = self
            .prepare_shadow_table(&connection, &task_parameters, &parameters)
            .await;
        if let Err(err) = prepared {
            // prepare drops what it created; an existing shadow table is not ours
            self.mark_failed(&ctx, &err).await?;
            return Err(err);
        }

        self.repository()
            .update_status(task_id, TaskStatus::Running)
            .await
            .map_err(OscError::storage)?;
        ctx.schedule_task.status = TaskStatus::Running;

        if let Err(err) = self.bootstrap_pipeline().invoke(&mut ctx).await {
            let armed = self
                .monitor()
                .exists(schedule_id)
                .await
                .map_err(OscError::storage)?;
            // an armed monitor retries on the next tick; otherwise nothing would
            if err.is_fatal() || !armed {
                self.fail(&ctx, &err).await?;
            } else {
                warn!(%err, "bootstrap incomplete, left to the monitor");
            }
            return Err(err);
        }
        self.store.get_task(task_id).await.map_err(OscError::storage)
    }

    /// One reconcile pass for an armed monitor.
    #[instrument(skip_all, fields(schedule_id = trigger.schedule_id))]
    pub async fn tick(&self, trigger: &MonitorTrigger) -> Result<(), OscError> {
        let mut ctx = self.load_context(trigger.schedule_task_id).await?;
        if ctx.schedule_task.status.is_terminal() {
            info!(status = ctx.schedule_task.status.as_str(), "task already finished");
            return self
                .monitor()
                .disable(trigger.schedule_id)
                .await
                .map_err(OscError::storage);
        }

        let err = match self.check_pipeline().invoke(&mut ctx).await {
            Ok(()) => return self.clear_failed_poll_time(ctx.schedule_task.id).await,
            Err(err) => err,
        };
        if err.is_fatal() {
            error!(%err, "schema change failed");
            self.fail(&ctx, &err).await?;
        } else {
            warn!(%err, "reconcile failed");
            self.record_transient_failure(&ctx, &err).await?;
        }
        Err(err)
    }

    /// Approves the swap of a job waiting at the manual gate.
    #[instrument(skip_all, fields(task_id = task_id))]
    pub async fn request_manual_swap(&self, task_id: i64) -> Result<(), OscError> {
        let task = self.store.get_task(task_id).await.map_err(OscError::storage)?;
        if task.status != TaskStatus::Running {
            return Err(OscError::InvalidParameters(format!(
                "task {} is {}",
                task_id,
                task.status.as_str()
            )));
        }
        let mut blob = task.result();
        if !blob.manual_swap_table_enabled {
            return Err(OscError::InvalidParameters(format!(
                "task {} is not waiting for a manual swap",
                task_id
            )));
        }
        blob.manual_swap_table_started = true;
        self.persist_blob(&task, &blob).await?;
        info!("manual swap requested");
        Ok(())
    }

    /// Changes the throttle of a job. The next reconcile pass pushes it to the
    /// migration project.
    #[instrument(skip_all, fields(task_id = task_id))]
    pub async fn update_rate_limit(
        &self,
        task_id: i64,
        config: RateLimiterConfig,
    ) -> Result<(), OscError> {
        if config.row_limit.is_some_and(|v| v < 0) || config.data_size_limit.is_some_and(|v| v < 0)
        {
            return Err(OscError::InvalidParameters(format!(
                "rate limit must not be negative: {:?}",
                config
            )));
        }
        let task = self.store.get_task(task_id).await.map_err(OscError::storage)?;
        if task.status.is_terminal() {
            return Err(OscError::InvalidParameters(format!(
                "task {} is {}",
                task_id,
                task.status.as_str()
            )));
        }
        let schedule = self
            .store
            .get_schedule(task.schedule_id)
            .await
            .map_err(OscError::storage)?;
        let mut parameters = schedule.job_parameters;
        if parameters.rate_limit_config == config {
            debug!("rate limit unchanged");
            return Ok(());
        }
        parameters.rate_limit_config = config;
        self.store
            .update_job_parameters(schedule.id, &parameters)
            .await
            .map_err(OscError::storage)?;
        info!(rate_limit = ?parameters.rate_limit_config, "rate limit updated");
        Ok(())
    }

    pub async fn status(
        &self,
        task_id: i64,
    ) -> Result<(ScheduleTask, ScheduleTaskResult), OscError> {
        let task = self.store.get_task(task_id).await.map_err(OscError::storage)?;
        let result = task.result();
        Ok((task, result))
    }

    async fn load_context(&self, task_id: i64) -> Result<OscContext, OscError> {
        let task = self.store.get_task(task_id).await.map_err(OscError::storage)?;
        let schedule = self
            .store
            .get_schedule(task.schedule_id)
            .await
            .map_err(OscError::storage)?;
        let connection = self.connections.connection(&schedule.connection_id)?;
        Ok(OscContext::new(schedule, task, connection))
    }

    async fn prepare_shadow_table(
        &self,
        connection: &ConnectionConfig,
        tp: &TaskParameters,
        parameters: &OscParameters,
    ) -> Result<(), OscError> {
        let mut session = self
            .sessions
            .open(connection, Some(&tp.database_name))
            .await?;
        let prepared = async {
            if !session.table_exists(&tp.database_name, &tp.origin_table_name).await? {
                return Err(OscError::InvalidParameters(format!(
                    "table {}.{} not found",
                    tp.database_name, tp.origin_table_name
                )));
            }
            if session.table_exists(&tp.database_name, &tp.new_table_name).await? {
                return Err(OscError::InvalidParameters(format!(
                    "shadow table {} already exists",
                    tp.new_table_name
                )));
            }
            let dialect = connection.dialect;
            let origin = quote_identifier(dialect, &tp.origin_table_name);
            let new = quote_identifier(dialect, &tp.new_table_name);
            let create = match dialect {
                DialectType::ObMysql => format!("CREATE TABLE {new} LIKE {origin}"),
                DialectType::ObOracle => {
                    format!("CREATE TABLE {new} AS SELECT * FROM {origin} WHERE 1 = 0")
                }
            };
            session.execute(&create).await?;
            let altered =
                alter_shadow_table(session.as_mut(), tp, &new, &parameters.alter_clause).await;
            if altered.is_err() {
                if let Err(err) = session.execute(&format!("DROP TABLE {new}")).await {
                    warn!(?err, "failed to drop shadow table");
                }
            }
            altered?;
            info!(table = %tp.new_table_name, "shadow table prepared");
            Ok(())
        }
        .await;
        if let Err(err) = session.close().await {
            warn!(?err, "failed to close session");
        }
        prepared
    }

    /// Marks the task failed, then releases the migration project and drops
    /// the shadow table.
    async fn fail(&self, ctx: &OscContext, err: &OscError) -> Result<(), OscError> {
        let task = self.mark_failed(ctx, err).await?;
        release_project(self.api.as_ref(), &task.parameters).await;
        if let Err(err) = self
            .drop_shadow_table(&ctx.connection_config, &task.parameters)
            .await
        {
            warn!(%err, table = %task.parameters.new_table_name, "failed to drop shadow table");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        ctx: &OscContext,
        err: &OscError,
    ) -> Result<ScheduleTask, OscError> {
        let task = self
            .store
            .get_task(ctx.schedule_task.id)
            .await
            .map_err(OscError::storage)?;
        let mut blob = task.result();
        blob.description = Some(err.to_string());
        self.persist_blob(&task, &blob).await?;
        self.repository()
            .update_status(task.id, TaskStatus::Failed)
            .await
            .map_err(OscError::storage)?;
        self.monitor()
            .disable(ctx.schedule.id)
            .await
            .map_err(OscError::storage)?;
        Ok(task)
    }

    async fn drop_shadow_table(
        &self,
        connection: &ConnectionConfig,
        tp: &TaskParameters,
    ) -> Result<(), OscError> {
        let mut session = self
            .sessions
            .open(connection, Some(&tp.database_name))
            .await?;
        let dropped = async {
            if session.table_exists(&tp.database_name, &tp.new_table_name).await? {
                let new = quote_identifier(connection.dialect, &tp.new_table_name);
                session.execute(&format!("DROP TABLE {new}")).await?;
                info!(table = %tp.new_table_name, "shadow table dropped");
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(err) = session.close().await {
            warn!(?err, "failed to close session");
        }
        Ok(dropped?)
    }

    async fn clear_failed_poll_time(&self, task_id: i64) -> Result<(), OscError> {
        let task = self.store.get_task(task_id).await.map_err(OscError::storage)?;
        let mut blob = task.result();
        if blob.last_check_failed_time_second.take().is_some() {
            self.persist_blob(&task, &blob).await?;
        }
        Ok(())
    }

    /// Failed polls are retried until the first one is older than the step
    /// failure timeout.
    async fn record_transient_failure(
        &self,
        ctx: &OscContext,
        err: &OscError,
    ) -> Result<(), OscError> {
        let task = self
            .store
            .get_task(ctx.schedule_task.id)
            .await
            .map_err(OscError::storage)?;
        let mut blob = task.result();
        let now = Utc::now().timestamp();
        let first = *blob.last_check_failed_time_second.get_or_insert(now);
        let timeout = self.properties.check_project_step_failed_timeout.as_secs() as i64;
        if now - first > timeout {
            error!(first_failed_at = first, "reconcile kept failing, giving up");
            return self.fail(ctx, err).await;
        }
        self.persist_blob(&task, &blob).await
    }

    async fn persist_blob(
        &self,
        task: &ScheduleTask,
        blob: &ScheduleTaskResult,
    ) -> Result<(), OscError> {
        let json = serde_json::to_string(blob).map_err(|e| OscError::Other(e.into()))?;
        self.repository()
            .update_result(task.id, &json, task.progress_percentage)
            .await
            .map_err(OscError::storage)
    }
}

/// Applies the alter clause and checks the column names survived it.
async fn alter_shadow_table(
    session: &mut dyn DbSession,
    tp: &TaskParameters,
    quoted_new: &str,
    alter_clause: &str,
) -> Result<(), OscError> {
    session
        .execute(&format!("ALTER TABLE {quoted_new} {}", alter_clause.trim()))
        .await
        .context("failed to apply the alter clause to the shadow table")?;
    let origin = session
        .list_columns(&tp.database_name, &tp.origin_table_name)
        .await?;
    let new = session
        .list_columns(&tp.database_name, &tp.new_table_name)
        .await?;
    if !same_column_names(&origin, &new) {
        return Err(OscError::InvalidParameters(format!(
            "column names of {} differ from the origin table: {:?} vs {:?}",
            tp.new_table_name, new, origin
        )));
    }
    Ok(())
}

fn same_column_names(a: &[String], b: &[String]) -> bool {
    let normalize = |columns: &[String]| {
        let mut names: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
        names.sort();
        names
    };
    normalize(a) == normalize(b)
}

fn task_parameters_for(parameters: &OscParameters) -> TaskParameters {
    let table = &parameters.table_name;
    TaskParameters {
        database_name: parameters.database_name.clone(),
        origin_table_name: table.clone(),
        new_table_name: format!("_{table}_osc_new_"),
        renamed_table_name: format!("_{table}_osc_old_"),
        correlation_id: Some(uuid::Uuid::new_v4().simple().to_string()),
        ..Default::default()
    }
}

fn is_identifier(name: &str) -> Result<bool, OscError> {
    match IDENTIFIER.as_ref() {
        Ok(re) => Ok(re.is_match(name)),
        Err(err) => Err(anyhow!("identifier pattern: {err}").into()),
    }
}

fn validate_parameters(parameters: &OscParameters) -> Result<(), OscError> {
    if !is_identifier(&parameters.database_name)? {
        return Err(OscError::InvalidParameters(format!(
            "invalid database name {:?}",
            parameters.database_name
        )));
    }
    let table = &parameters.table_name;
    if !is_identifier(table)? || table.len() > MAX_TABLE_NAME_LEN {
        return Err(OscError::InvalidParameters(format!(
            "invalid table name {:?}",
            table
        )));
    }
    let clause = parameters.alter_clause.trim();
    if clause.is_empty() || clause.contains(';') {
        return Err(OscError::InvalidParameters(
            "alter clause must be a single non-empty statement".into(),
        ));
    }
    if let Some(user) = parameters.lock_users.iter().find(|u| u.trim().is_empty()) {
        return Err(OscError::InvalidParameters(format!("invalid lock user {:?}", user)));
    }
    Ok(())
}
