use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{Next, OscContext, Stage, StageId};
use crate::config::OscProperties;
use crate::db::{MonitorScheduler, MonitorTrigger, ScheduleTaskRepository};
use crate::error::OscError;
use crate::model::DialectType;
use crate::oms::model::{
    CommonTransferConfig, CreateDataSourceRequest, CreateProjectRequest, DatabaseTransferObject,
    OceanBaseType, ProjectControlRequest, SpecificTransferMapping, TableTransferObject,
    TransferThrottleConfig,
};
use crate::oms::{MigrationApi, OmsError};
use crate::session::{DbSession, SessionFactory};

const CONFIG_URL_SQL: &str = "show parameters like 'obconfig_url'";
const VERSION_COMMENT_SQL: &str = "show variables like 'version_comment'";

/// Hooks that decide how the migration service requests are built.
#[async_trait]
pub trait ProjectRequestStrategy: Send + Sync {
    async fn build_data_source_request(
        &self,
        ctx: &OscContext,
        session: &mut dyn DbSession,
    ) -> Result<CreateDataSourceRequest, OscError>;

    /// Called once after the service rejected `request`. `Ok(None)` gives up.
    async fn recover_data_source(
        &self,
        api: &dyn MigrationApi,
        request: &CreateDataSourceRequest,
        error: &OmsError,
    ) -> Result<Option<String>, OscError>;

    fn build_project_request(&self, ctx: &OscContext, data_source_id: &str)
        -> CreateProjectRequest;
}

/// Requests for jobs submitted from the console: credentials come from the
/// connection config, topology from the target database itself.
#[derive(Debug, Clone)]
pub struct ConsoleRequestStrategy {
    properties: OscProperties,
}

impl ConsoleRequestStrategy {
    pub fn new(properties: OscProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl ProjectRequestStrategy for ConsoleRequestStrategy {
    async fn build_data_source_request(
        &self,
        ctx: &OscContext,
        session: &mut dyn DbSession,
    ) -> Result<CreateDataSourceRequest, OscError> {
        let config = &ctx.connection_config;
        let config_url = session
            .query_single_value(CONFIG_URL_SQL, "value")
            .await?
            .ok_or_else(|| anyhow!("obconfig_url is empty"))?;

        let mut ob_type = match config.dialect {
            DialectType::ObMysql => OceanBaseType::ObMysql,
            DialectType::ObOracle => OceanBaseType::ObOracle,
        };
        if config.dialect == DialectType::ObMysql {
            let comment = session
                .query_single_value(VERSION_COMMENT_SQL, "value")
                .await?
                .ok_or_else(|| anyhow!("version_comment is empty"))?;
            if comment.starts_with("OceanBase_CE") {
                ob_type = OceanBaseType::ObMysqlCe;
            }
        }

        Ok(CreateDataSourceRequest {
            name: data_source_name(),
            ob_type: Some(ob_type),
            tenant: config.tenant.clone(),
            cluster: config.cluster.clone(),
            user_name: config.username.clone(),
            password: config.password.as_deref().map(encode_password),
            ip: config.host.clone(),
            port: config.port,
            region: self.properties.region.clone(),
            config_url: Some(config_url),
            drc_user_name: config.sys_tenant_username.clone(),
            drc_password: config.sys_tenant_password.as_deref().map(encode_password),
            ocp_name: None,
        })
    }

    async fn recover_data_source(
        &self,
        api: &dyn MigrationApi,
        request: &CreateDataSourceRequest,
        error: &OmsError,
    ) -> Result<Option<String>, OscError> {
        // most rejections are name clashes; retry once under a fresh name
        let retry = CreateDataSourceRequest {
            name: data_source_name(),
            ..request.clone()
        };
        info!(code = ?error.code(), "retrying data source creation under a new name");
        api.create_data_source(&retry)
            .await
            .map(Some)
            .map_err(|e| OscError::DataSourceCreation(e.to_string()))
    }

    fn build_project_request(
        &self,
        ctx: &OscContext,
        data_source_id: &str,
    ) -> CreateProjectRequest {
        let tp = &ctx.task_parameters;
        let limits = &ctx.parameters.rate_limit_config;
        let throttle = TransferThrottleConfig {
            throttle_rps: limits.row_limit,
            throttle_iops: limits.data_size_limit,
        };
        CreateProjectRequest {
            name: format!("osc_{}_{}", ctx.schedule.id, ctx.schedule_task.id),
            label: None,
            project_type: "MIGRATION".into(),
            source_endpoint_id: data_source_id.to_string(),
            sink_endpoint_id: data_source_id.to_string(),
            transfer_mapping: SpecificTransferMapping {
                databases: vec![DatabaseTransferObject {
                    name: tp.database_name.clone(),
                    mapped_name: tp.database_name.clone(),
                    tables: vec![TableTransferObject {
                        name: tp.origin_table_name.clone(),
                        mapped_name: tp.new_table_name.clone(),
                    }],
                }],
                ..Default::default()
            },
            common_transfer_config: CommonTransferConfig::default(),
            enable_struct_transfer: false,
            enable_full_transfer: true,
            enable_incr_transfer: true,
            enable_full_verify: self.properties.enable_full_verify,
            full_transfer_config: throttle.clone(),
            incr_transfer_config: throttle,
            uid: tp.uid.clone(),
        }
    }
}

fn data_source_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn encode_password(password: &str) -> String {
    STANDARD.encode(password.as_bytes())
}

/// Creates the data source and migration project, starts it and arms the
/// periodic monitor. Ids already on the task are reused.
pub struct CreateProjectStage {
    api: Arc<dyn MigrationApi>,
    repository: Arc<dyn ScheduleTaskRepository>,
    monitor: Arc<dyn MonitorScheduler>,
    sessions: Arc<dyn SessionFactory>,
    strategy: Arc<dyn ProjectRequestStrategy>,
}

impl CreateProjectStage {
    pub fn new(
        api: Arc<dyn MigrationApi>,
        repository: Arc<dyn ScheduleTaskRepository>,
        monitor: Arc<dyn MonitorScheduler>,
        sessions: Arc<dyn SessionFactory>,
        strategy: Arc<dyn ProjectRequestStrategy>,
    ) -> Self {
        Self {
            api,
            repository,
            monitor,
            sessions,
            strategy,
        }
    }

    async fn create_data_source(&self, ctx: &OscContext) -> Result<String, OscError> {
        let mut session = self.sessions.open(&ctx.connection_config, None).await?;
        let built = self
            .strategy
            .build_data_source_request(ctx, session.as_mut())
            .await;
        if let Err(err) = session.close().await {
            warn!(?err, "failed to close session");
        }
        let request = built?;

        let id = match self.api.create_data_source(&request).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(%err, "create data source failed");
                self.strategy
                    .recover_data_source(self.api.as_ref(), &request, &err)
                    .await?
            }
        };
        let id = id
            .filter(|id| !id.trim().is_empty())
            .ok_or(OscError::MissingDataSourceId)?;
        info!(data_source_id = %id, "data source created");
        Ok(id)
    }

    async fn persist_parameters(&self, ctx: &mut OscContext) -> Result<(), OscError> {
        self.repository
            .update_task_parameters(ctx.schedule_task.id, &ctx.task_parameters)
            .await
            .map_err(OscError::storage)?;
        ctx.schedule_task.parameters = ctx.task_parameters.clone();
        Ok(())
    }

    async fn arm_monitor(&self, ctx: &OscContext) -> Result<(), OscError> {
        let trigger = MonitorTrigger {
            schedule_id: ctx.schedule.id,
            schedule_task_id: ctx.schedule_task.id,
            oms_project_id: ctx.task_parameters.oms_project_id.clone(),
        };
        let exists = self
            .monitor
            .exists(trigger.schedule_id)
            .await
            .map_err(OscError::storage)?;
        let armed = if exists {
            self.monitor.refresh_trigger_data(&trigger).await
        } else {
            self.monitor.create(&trigger).await
        };
        armed.map_err(OscError::storage)?;
        info!(schedule_id = trigger.schedule_id, refreshed = exists, "monitor armed");
        Ok(())
    }
}

fn non_empty(id: &Option<String>) -> Option<String> {
    id.as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Stage for CreateProjectStage {
    fn id(&self) -> StageId {
        StageId::CreateProject
    }

    #[instrument(skip_all, fields(task_id = ctx.schedule_task.id))]
    async fn invoke(&self, ctx: &mut OscContext, next: Next<'_>) -> Result<(), OscError> {
        let data_source_id = match non_empty(&ctx.task_parameters.oms_data_source_id) {
            Some(id) => id,
            None => {
                let id = self.create_data_source(ctx).await?;
                ctx.task_parameters.oms_data_source_id = Some(id.clone());
                self.persist_parameters(ctx).await?;
                id
            }
        };

        let project_id = match non_empty(&ctx.task_parameters.oms_project_id) {
            Some(id) => id,
            None => {
                let request = self.strategy.build_project_request(ctx, &data_source_id);
                let id = self.api.create_project(&request).await?;
                info!(project_id = %id, %data_source_id, "migration project created");
                ctx.task_parameters.oms_project_id = Some(id.clone());
                ctx.task_parameters.rate_limit_config = ctx.parameters.rate_limit_config.clone();
                self.persist_parameters(ctx).await?;
                id
            }
        };

        let started = self
            .api
            .start_project(&ProjectControlRequest {
                id: project_id.clone(),
                uid: ctx.task_parameters.uid.clone(),
            })
            .await;
        // the monitor is armed even when start failed, so polling can retry
        let armed = self.arm_monitor(ctx).await;
        started?;
        armed?;
        info!(%project_id, "migration project started");
        next.invoke(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::context;

    #[test]
    fn project_request_maps_origin_to_new_table() {
        let mut ctx = context();
        ctx.parameters.rate_limit_config.row_limit = Some(500);
        ctx.parameters.rate_limit_config.data_size_limit = Some(1024);
        ctx.task_parameters.uid = Some("u1".into());
        let strategy = ConsoleRequestStrategy::new(OscProperties {
            enable_full_verify: true,
            ..Default::default()
        });

        let req = strategy.build_project_request(&ctx, "ds-1");
        assert_eq!(req.source_endpoint_id, "ds-1");
        assert_eq!(req.sink_endpoint_id, "ds-1");
        assert!(req.enable_full_verify);
        assert_eq!(req.transfer_mapping.mode, "SPECIFIC");
        let db = &req.transfer_mapping.databases[0];
        assert_eq!(db.name, "db");
        assert_eq!(db.tables[0].name, "orders");
        assert_eq!(db.tables[0].mapped_name, "_orders_osc_new_");
        assert_eq!(req.full_transfer_config.throttle_rps, Some(500));
        assert_eq!(req.incr_transfer_config.throttle_iops, Some(1024));
        assert_eq!(req.uid.as_deref(), Some("u1"));
    }

    #[test]
    fn names_and_passwords() {
        let name = data_source_name();
        assert_eq!(name.len(), 32);
        assert!(!name.contains('-'));
        assert_eq!(encode_password("pw"), "cHc=");
    }
}
