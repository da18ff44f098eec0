//! Request and response payloads of the migration service open API.
//!
//! Field names follow the service's camelCase wire format. Response structs
//! tolerate missing fields since the service omits nulls inconsistently.

use serde::{Deserialize, Serialize};

/// Steps reported by the migration service for a project.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepName {
    TransferPrecheck,
    FullTransfer,
    TransferIncrLogPull,
    IncrTransfer,
    FullVerifier,
    #[serde(other)]
    Unknown,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::TransferPrecheck => "TRANSFER_PRECHECK",
            StepName::FullTransfer => "FULL_TRANSFER",
            StepName::TransferIncrLogPull => "TRANSFER_INCR_LOG_PULL",
            StepName::IncrTransfer => "INCR_TRANSFER",
            StepName::FullVerifier => "FULL_VERIFIER",
            StepName::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> StepName {
        match s {
            "TRANSFER_PRECHECK" => StepName::TransferPrecheck,
            "FULL_TRANSFER" => StepName::FullTransfer,
            "TRANSFER_INCR_LOG_PULL" => StepName::TransferIncrLogPull,
            "INCR_TRANSFER" => StepName::IncrTransfer,
            "FULL_VERIFIER" => StepName::FullVerifier,
            _ => StepName::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Init,
    NotStarted,
    Running,
    Monitoring,
    Suspend,
    Finished,
    Failed,
    #[serde(other)]
    Unknown,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Init => "INIT",
            StepStatus::NotStarted => "NOT_STARTED",
            StepStatus::Running => "RUNNING",
            StepStatus::Monitoring => "MONITORING",
            StepStatus::Suspend => "SUSPEND",
            StepStatus::Finished => "FINISHED",
            StepStatus::Failed => "FAILED",
            StepStatus::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Init,
    Running,
    Suspend,
    Finished,
    Failed,
    Deleted,
    Releasing,
    Released,
    #[serde(other)]
    Unknown,
}

impl ProjectStatus {
    pub fn is_destroyed(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Deleted | ProjectStatus::Releasing | ProjectStatus::Released
        )
    }
}

/// OceanBase flavour of an external datasource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OceanBaseType {
    ObMysql,
    ObOracle,
    ObMysqlCe,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateDataSourceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub ob_type: Option<OceanBaseType>,
    pub tenant: Option<String>,
    pub cluster: Option<String>,
    pub user_name: String,
    /// Base64 encoded.
    pub password: Option<String>,
    pub ip: String,
    pub port: u16,
    pub region: String,
    pub config_url: Option<String>,
    pub drc_user_name: Option<String>,
    /// Base64 encoded.
    pub drc_password: Option<String>,
    pub ocp_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableTransferObject {
    pub name: String,
    pub mapped_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseTransferObject {
    pub name: String,
    pub mapped_name: String,
    pub tables: Vec<TableTransferObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecificTransferMapping {
    pub mode: String,
    pub databases: Vec<DatabaseTransferObject>,
}

impl Default for SpecificTransferMapping {
    fn default() -> Self {
        Self {
            mode: "SPECIFIC".into(),
            databases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommonTransferConfig {
    pub table_category: Option<String>,
}

/// Throttle settings shared by the full and incremental phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferThrottleConfig {
    pub throttle_rps: Option<i32>,
    #[serde(rename = "throttleIOPS")]
    pub throttle_iops: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub project_type: String,
    pub source_endpoint_id: String,
    pub sink_endpoint_id: String,
    pub transfer_mapping: SpecificTransferMapping,
    pub common_transfer_config: CommonTransferConfig,
    pub enable_struct_transfer: bool,
    pub enable_full_transfer: bool,
    pub enable_incr_transfer: bool,
    pub enable_full_verify: bool,
    pub full_transfer_config: TransferThrottleConfig,
    pub incr_transfer_config: TransferThrottleConfig,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectControlRequest {
    pub id: String,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectConfigRequest {
    pub id: String,
    pub uid: Option<String>,
    pub full_transfer_config: TransferThrottleConfig,
    pub incr_transfer_config: TransferThrottleConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListFullVerifyResultRequest {
    pub project_id: String,
    pub source_schemas: Vec<String>,
    pub dest_schemas: Vec<String>,
    pub status: Vec<String>,
    pub page_size: u32,
    pub page_number: u32,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StepExtraInfo {
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

/// Union of the per-step info payloads; each step fills only its own fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StepInfo {
    pub capacity: Option<i64>,
    pub processed_records: Option<i64>,
    pub incr_timestamp_checkpoint: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStep {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub extra_info: Option<StepExtraInfo>,
    #[serde(default)]
    pub step_info: Option<StepInfo>,
}

impl ProjectStep {
    pub fn error_msg(&self) -> Option<&str> {
        self.extra_info.as_ref().and_then(|e| e.error_msg.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectProgress {
    pub status: ProjectStatus,
    #[serde(default)]
    pub current_step: Option<String>,
    /// Seconds since epoch up to which incremental changes have been applied.
    #[serde(default)]
    pub incr_sync_checkpoint: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FullVerifyTableStatistic {
    pub source_table_name: Option<String>,
    pub dest_table_name: Option<String>,
    pub result_desc: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FullVerifyResult {
    pub different_number: Option<i64>,
    pub full_verify_table_statistics: Vec<FullVerifyTableStatistic>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorDetail {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Envelope wrapping every response of the open API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReturnResult<T> {
    pub success: bool,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub data: Option<T>,
}
