use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::checker::{apply_verification, ProjectStepResult, ProjectStepResultChecker};
use super::{Next, OscContext, Stage, StageId};
use crate::config::OscProperties;
use crate::db::ScheduleTaskRepository;
use crate::error::OscError;
use crate::model::{
    FullVerificationResult, ScheduleTaskResult, StepFailureTimes, SwapTableType, TaskStatus,
};
use crate::oms::model::{
    ListFullVerifyResultRequest, ProjectControlRequest, ProjectStatus, StepName,
    TransferThrottleConfig, UpdateProjectConfigRequest,
};
use crate::oms::MigrationApi;

const VERIFY_STATUS_FILTER: [&str; 3] = ["FINISHED", "SUSPEND", "RUNNING"];

/// Polls the migration project, records its progress, and decides whether
/// the job may move on to the swap.
pub struct CheckProjectStage {
    api: Arc<dyn MigrationApi>,
    repository: Arc<dyn ScheduleTaskRepository>,
    properties: OscProperties,
}

impl CheckProjectStage {
    pub fn new(
        api: Arc<dyn MigrationApi>,
        repository: Arc<dyn ScheduleTaskRepository>,
        properties: OscProperties,
    ) -> Self {
        Self {
            api,
            repository,
            properties,
        }
    }

    async fn persist(
        &self,
        ctx: &mut OscContext,
        blob: &ScheduleTaskResult,
        progress: f64,
    ) -> Result<(), OscError> {
        let json = serde_json::to_string(blob).map_err(|e| OscError::Other(e.into()))?;
        self.repository
            .update_result(ctx.schedule_task.id, &json, progress)
            .await
            .map_err(OscError::storage)?;
        ctx.schedule_task.result_json = Some(json);
        ctx.schedule_task.progress_percentage = progress;
        Ok(())
    }

    /// Applies a changed rate limit. Returns true when the tick should end.
    async fn sync_rate_limit(
        &self,
        ctx: &mut OscContext,
        control: &ProjectControlRequest,
        status: ProjectStatus,
    ) -> Result<bool, OscError> {
        let wanted = &ctx.parameters.rate_limit_config;
        if *wanted == ctx.task_parameters.rate_limit_config {
            return Ok(false);
        }
        match status {
            ProjectStatus::Running => {
                info!(project_id = %control.id, ?wanted, "rate limit changed, stopping project");
                self.api.stop_project(control).await?;
                Ok(true)
            }
            ProjectStatus::Suspend => {
                let throttle = TransferThrottleConfig {
                    throttle_rps: wanted.row_limit,
                    throttle_iops: wanted.data_size_limit,
                };
                self.api
                    .update_project_config(&UpdateProjectConfigRequest {
                        id: control.id.clone(),
                        uid: control.uid.clone(),
                        full_transfer_config: throttle.clone(),
                        incr_transfer_config: throttle,
                    })
                    .await?;
                self.api.resume_project(control).await?;
                ctx.task_parameters.rate_limit_config = wanted.clone();
                self.repository
                    .update_task_parameters(ctx.schedule_task.id, &ctx.task_parameters)
                    .await
                    .map_err(OscError::storage)?;
                ctx.schedule_task.parameters = ctx.task_parameters.clone();
                info!(project_id = %control.id, "rate limit applied, project resumed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Fetches the project report and folds it into a [`ProjectStepResult`]. The
/// verification result is only requested once the job finished.
pub(crate) async fn inspect_project(
    api: &dyn MigrationApi,
    properties: &OscProperties,
    database: &str,
    control: &ProjectControlRequest,
    failure_times: StepFailureTimes,
) -> Result<ProjectStepResult, OscError> {
    let steps = api.describe_project_steps(control).await?;
    let progress = api.describe_project_progress(control).await?;
    debug!(?steps, ?progress, "project report");

    let mut result = ProjectStepResultChecker::new(
        &progress,
        &steps,
        properties.enable_full_verify,
        properties.check_project_step_failed_timeout,
        failure_times,
        Utc::now(),
    )
    .check();

    let verify = if result.task_status == TaskStatus::Done && properties.enable_full_verify {
        let request = ListFullVerifyResultRequest {
            project_id: control.id.clone(),
            source_schemas: vec![database.to_string()],
            dest_schemas: vec![database.to_string()],
            status: VERIFY_STATUS_FILTER.iter().map(|s| s.to_string()).collect(),
            page_size: 10,
            page_number: 1,
            uid: control.uid.clone(),
        };
        Some(api.list_full_verify_result(&request).await?)
    } else {
        None
    };
    apply_verification(&mut result, properties.enable_full_verify, verify.as_ref());
    Ok(result)
}

fn to_blob(result: &ProjectStepResult, last: &ScheduleTaskResult) -> ScheduleTaskResult {
    ScheduleTaskResult {
        current_step: result.current_step.clone(),
        current_step_status: result.current_step_status.clone(),
        precheck_result: result.precheck_result,
        precheck_result_description: result
            .precheck_failed()
            .then(|| result.error_msg.clone())
            .flatten(),
        full_transfer_estimated_count: result.full_transfer_estimated_count,
        full_transfer_finished_count: result.full_transfer_finished_count,
        full_transfer_progress_percentage: result.full_transfer_progress_percentage,
        full_verification_result: result.full_verification_result,
        full_verification_result_description: result.full_verification_result_description.clone(),
        full_verification_progress_percentage: result.full_verification_progress_percentage,
        check_failed_time: result.check_failed_time.clone(),
        manual_swap_table_enabled: last.manual_swap_table_enabled,
        manual_swap_table_started: last.manual_swap_table_started,
        // cleared by the handler once a whole pass succeeds
        last_check_failed_time_second: last.last_check_failed_time_second,
        description: None,
    }
}

fn log_progress(project_id: &str, blob: &ScheduleTaskResult) {
    let step = blob.current_step.as_deref().map(StepName::parse);
    let (progress, description) = match step {
        Some(StepName::TransferPrecheck) => (None, blob.precheck_result_description.clone()),
        Some(StepName::FullTransfer) => (
            Some(blob.full_transfer_progress_percentage),
            Some(format!(
                "{}/{}",
                blob.full_transfer_finished_count.unwrap_or_default(),
                blob.full_transfer_estimated_count.unwrap_or_default()
            )),
        ),
        Some(StepName::FullVerifier) => (
            Some(blob.full_verification_progress_percentage),
            blob.full_verification_result_description.clone(),
        ),
        _ => (None, None),
    };
    info!(
        project_id,
        step = blob.current_step.as_deref().unwrap_or_default(),
        status = blob.current_step_status.as_deref().unwrap_or_default(),
        ?progress,
        description = description.as_deref().unwrap_or_default(),
        "migration progress"
    );
}

#[async_trait]
impl Stage for CheckProjectStage {
    fn id(&self) -> StageId {
        StageId::CheckProject
    }

    #[instrument(skip_all, fields(task_id = ctx.schedule_task.id))]
    async fn invoke(&self, ctx: &mut OscContext, next: Next<'_>) -> Result<(), OscError> {
        let project_id = ctx
            .task_parameters
            .oms_project_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("task {} has no migration project", ctx.schedule_task.id))?;
        let control = ProjectControlRequest {
            id: project_id.clone(),
            uid: ctx.task_parameters.uid.clone(),
        };

        let last = ctx.schedule_task.result();
        let result = inspect_project(
            self.api.as_ref(),
            &self.properties,
            &ctx.task_parameters.database_name,
            &control,
            last.check_failed_time.clone(),
        )
        .await?;
        let mut blob = to_blob(&result, &last);
        self.persist(ctx, &blob, result.task_percentage).await?;
        log_progress(&project_id, &blob);

        if self
            .sync_rate_limit(ctx, &control, result.project_status)
            .await?
        {
            return Ok(());
        }

        if result.resume_requested {
            if let Err(err) = self.api.resume_project(&control).await {
                warn!(%project_id, %err, "resume project failed");
            }
        }

        if result.task_status == TaskStatus::Done && result.verification_accepted() {
            let swap_ready = ctx.schedule_task.status == TaskStatus::Running
                && blob.full_transfer_progress_percentage >= 100.0;
            if !swap_ready {
                debug!(%project_id, "migration done but swap not ready yet");
                return Ok(());
            }
            return match ctx.parameters.swap_table_type {
                SwapTableType::Auto => next.invoke(ctx).await,
                SwapTableType::Manual if blob.manual_swap_table_started => next.invoke(ctx).await,
                SwapTableType::Manual => {
                    if !blob.manual_swap_table_enabled {
                        blob.manual_swap_table_enabled = true;
                        self.persist(ctx, &blob, result.task_percentage).await?;
                    }
                    info!(%project_id, "migration ready, waiting for manual swap");
                    Ok(())
                }
            };
        }

        let message = result.error_msg.clone().unwrap_or_default();
        if result.precheck_failed() {
            Err(OscError::PrecheckFailed(message))
        } else if result.task_status == TaskStatus::Failed {
            Err(OscError::ExecutionFailed(message))
        } else if result.full_verification_result == Some(FullVerificationResult::Inconsistent) {
            Err(OscError::DataInconsistent(
                result
                    .full_verification_result_description
                    .clone()
                    .unwrap_or_default(),
            ))
        } else {
            Ok(())
        }
    }
}
