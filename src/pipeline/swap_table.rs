use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::check_project::inspect_project;
use super::wait::poll_until;
use super::{CompletionHandler, Next, OscContext, Stage, StageId};
use crate::config::OscProperties;
use crate::error::OscError;
use crate::lock_monitor::LockUserMonitor;
use crate::model::{StepFailureTimes, TaskStatus};
use crate::oms::model::ProjectControlRequest;
use crate::oms::MigrationApi;
use crate::rename::{CatchUpProbe, SwapOutcome, SwapTables, TableSwapper};
use crate::session::SessionFactory;

/// Waits until the incremental checkpoint passes the moment the probe was
/// asked, with the migration still done and its verification accepted.
pub struct CheckpointProbe {
    api: Arc<dyn MigrationApi>,
    properties: OscProperties,
    database: String,
    control: ProjectControlRequest,
}

impl CheckpointProbe {
    pub fn new(
        api: Arc<dyn MigrationApi>,
        properties: OscProperties,
        database: String,
        control: ProjectControlRequest,
    ) -> Self {
        Self {
            api,
            properties,
            database,
            control,
        }
    }

    async fn passed(&self, safe_point: i64) -> bool {
        let result = match inspect_project(
            self.api.as_ref(),
            &self.properties,
            &self.database,
            &self.control,
            StepFailureTimes::new(),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "catch-up check failed");
                return false;
            }
        };
        let checkpoint = result.increment_checkpoint.unwrap_or_default();
        debug!(checkpoint, safe_point, "incremental checkpoint");
        checkpoint > safe_point
            && result.task_status == TaskStatus::Done
            && result.verification_accepted()
    }
}

#[async_trait]
impl CatchUpProbe for CheckpointProbe {
    async fn caught_up(&self) -> Result<bool, OscError> {
        let safe_point = Utc::now().timestamp();
        let caught_up = poll_until(
            self.properties.catch_up_timeout,
            self.properties.catch_up_poll_interval,
            || self.passed(safe_point),
        )
        .await;
        Ok(caught_up)
    }
}

/// Terminal stage: keeps lock users out, swaps the tables once replication
/// caught up and reports completion.
pub struct SwapTableStage {
    api: Arc<dyn MigrationApi>,
    sessions: Arc<dyn SessionFactory>,
    completion: Arc<dyn CompletionHandler>,
    properties: OscProperties,
}

impl SwapTableStage {
    pub fn new(
        api: Arc<dyn MigrationApi>,
        sessions: Arc<dyn SessionFactory>,
        completion: Arc<dyn CompletionHandler>,
        properties: OscProperties,
    ) -> Self {
        Self {
            api,
            sessions,
            completion,
            properties,
        }
    }

    async fn swap(&self, ctx: &OscContext) -> Result<SwapOutcome, OscError> {
        let tp = &ctx.task_parameters;
        let project_id = tp
            .oms_project_id
            .clone()
            .ok_or_else(|| anyhow!("task {} has no migration project", ctx.schedule_task.id))?;
        let probe = CheckpointProbe::new(
            self.api.clone(),
            self.properties.clone(),
            tp.database_name.clone(),
            ProjectControlRequest {
                id: project_id,
                uid: tp.uid.clone(),
            },
        );
        let tables = SwapTables {
            schema: tp.database_name.clone(),
            origin: tp.origin_table_name.clone(),
            new: tp.new_table_name.clone(),
            renamed: tp.renamed_table_name.clone(),
        };
        let swapper = TableSwapper::new(
            ctx.connection_config.dialect,
            ctx.parameters.swap_table_name_retry_times,
            ctx.parameters.origin_table_clean_strategy,
        );

        let mut session = self
            .sessions
            .open(&ctx.connection_config, Some(&tp.database_name))
            .await?;
        let outcome = swapper.swap(session.as_mut(), &tables, &probe).await;
        if let Err(err) = session.close().await {
            warn!(?err, "failed to close session");
        }
        outcome
    }
}

#[async_trait]
impl Stage for SwapTableStage {
    fn id(&self) -> StageId {
        StageId::SwapTable
    }

    #[instrument(skip_all, fields(task_id = ctx.schedule_task.id))]
    async fn invoke(&self, ctx: &mut OscContext, next: Next<'_>) -> Result<(), OscError> {
        let users = ctx.parameters.lock_users.clone();
        let monitor = if users.is_empty() {
            None
        } else {
            let admin = self.sessions.open_admin(&ctx.connection_config).await?;
            let monitor = LockUserMonitor::start(
                admin.clone(),
                users,
                self.properties.lock_user_monitor_interval,
            );
            Some((monitor, admin))
        };

        let outcome = self.swap(ctx).await;
        if let Some((monitor, admin)) = monitor {
            monitor.stop().await;
            if let Err(err) = admin.close().await {
                warn!(?err, "failed to close admin session");
            }
        }

        match outcome? {
            SwapOutcome::NotCaughtUp => {
                info!("swap postponed to the next tick");
                Ok(())
            }
            SwapOutcome::Swapped | SwapOutcome::AlreadySwapped => {
                ctx.mark_swap_succeeded();
                self.completion.on_complete(ctx).await?;
                next.invoke(ctx).await
            }
        }
    }
}
