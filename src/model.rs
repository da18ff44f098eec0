use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::oms::model::StepName;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialectType {
    ObMysql,
    ObOracle,
}

impl DialectType {
    pub fn is_oracle(&self) -> bool {
        matches!(self, DialectType::ObOracle)
    }
}

/// Target database connection, as listed under `connections` in the config.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub id: String,
    pub dialect: DialectType,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub sys_tenant_username: Option<String>,
    #[serde(default)]
    pub sys_tenant_password: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("tenant", &self.tenant)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// OceanBase proxy login: `user@tenant#cluster`.
    pub fn login_user(&self) -> String {
        let mut user = self.username.clone();
        if let Some(tenant) = self.tenant.as_deref().filter(|t| !t.is_empty()) {
            user.push('@');
            user.push_str(tenant);
        }
        if let Some(cluster) = self.cluster.as_deref().filter(|c| !c.is_empty()) {
            user.push('#');
            user.push_str(cluster);
        }
        user
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Prepare,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Prepare => "PREPARE",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PREPARE" => Some(TaskStatus::Prepare),
            "RUNNING" => Some(TaskStatus::Running),
            "DONE" => Some(TaskStatus::Done),
            "FAILED" => Some(TaskStatus::Failed),
            "CANCELED" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrecheckResult {
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FullVerificationResult {
    Consistent,
    Inconsistent,
    Uncheck,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapTableType {
    #[default]
    Auto,
    Manual,
}

/// What happens to the original table after the swap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginTableCleanStrategy {
    #[default]
    OriginTableRenameAndReserved,
    OriginTableDrop,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    pub row_limit: Option<i32>,
    pub data_size_limit: Option<i64>,
}

fn default_swap_retry_times() -> u32 {
    3
}

/// User supplied job parameters, fixed at submit except for the rate limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OscParameters {
    pub database_name: String,
    pub table_name: String,
    /// Everything after `ALTER TABLE <name>` in the user's change.
    pub alter_clause: String,
    #[serde(default)]
    pub swap_table_type: SwapTableType,
    #[serde(default)]
    pub lock_users: Vec<String>,
    #[serde(default)]
    pub rate_limit_config: RateLimiterConfig,
    #[serde(default)]
    pub origin_table_clean_strategy: OriginTableCleanStrategy,
    #[serde(default = "default_swap_retry_times")]
    pub swap_table_name_retry_times: u32,
}

/// Migration identifiers for one table, built at submit and filled in by
/// the bootstrap stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskParameters {
    pub uid: Option<String>,
    pub oms_project_id: Option<String>,
    pub oms_data_source_id: Option<String>,
    pub database_name: String,
    pub origin_table_name: String,
    pub new_table_name: String,
    pub renamed_table_name: String,
    pub rate_limit_config: RateLimiterConfig,
    pub correlation_id: Option<String>,
}

/// First time each step was observed failed. An entry disappears as soon as a
/// later poll sees the step in any other status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct StepFailureTimes(BTreeMap<StepName, DateTime<Utc>>);

impl StepFailureTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first-seen time, recording `now` if the step is new.
    pub fn record(&mut self, step: StepName, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.0.entry(step).or_insert(now)
    }

    pub fn clear(&mut self, step: StepName) {
        self.0.remove(&step);
    }

    pub fn get(&self, step: StepName) -> Option<DateTime<Utc>> {
        self.0.get(&step).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// JSON blob persisted on the schedule task after every poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleTaskResult {
    pub current_step: Option<String>,
    pub current_step_status: Option<String>,
    pub precheck_result: Option<PrecheckResult>,
    pub precheck_result_description: Option<String>,
    pub full_transfer_estimated_count: Option<i64>,
    pub full_transfer_finished_count: Option<i64>,
    pub full_transfer_progress_percentage: f64,
    pub full_verification_result: Option<FullVerificationResult>,
    pub full_verification_result_description: Option<String>,
    pub full_verification_progress_percentage: f64,
    pub check_failed_time: StepFailureTimes,
    pub manual_swap_table_enabled: bool,
    pub manual_swap_table_started: bool,
    /// First time a poll of this task failed, cleared on the next success.
    pub last_check_failed_time_second: Option<i64>,
    /// Why the task ended in failure.
    pub description: Option<String>,
}

impl ScheduleTaskResult {
    pub fn from_json(json: Option<&str>) -> Self {
        json.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTask {
    pub id: i64,
    pub schedule_id: i64,
    pub status: TaskStatus,
    pub parameters: TaskParameters,
    pub result_json: Option<String>,
    pub progress_percentage: f64,
}

impl ScheduleTask {
    pub fn result(&self) -> ScheduleTaskResult {
        ScheduleTaskResult::from_json(self.result_json.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: i64,
    pub connection_id: String,
    pub job_parameters: OscParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn login_user_with_tenant_and_cluster() {
        let mut cfg = ConnectionConfig {
            id: "c".into(),
            dialect: DialectType::ObMysql,
            host: "h".into(),
            port: 2881,
            username: "u".into(),
            password: Some("secret".into()),
            tenant: Some("t".into()),
            cluster: Some("c1".into()),
            sys_tenant_username: None,
            sys_tenant_password: None,
        };
        assert_eq!(cfg.login_user(), "u@t#c1");
        cfg.cluster = None;
        assert_eq!(cfg.login_user(), "u@t");
        assert!(!format!("{cfg:?}").contains("secret"));
    }

    #[test]
    fn failure_times_keep_first_seen() {
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(2_000, 0).unwrap();
        let mut times = StepFailureTimes::new();
        assert_eq!(times.record(StepName::FullTransfer, t0), t0);
        assert_eq!(times.record(StepName::FullTransfer, t1), t0);
        times.clear(StepName::FullTransfer);
        assert!(times.is_empty());
        assert_eq!(times.record(StepName::FullTransfer, t1), t1);
    }

    #[test]
    fn result_blob_tolerates_partial_json() {
        let blob = ScheduleTaskResult::from_json(Some(
            r#"{"manualSwapTableEnabled": true, "checkFailedTime": {"FULL_TRANSFER": "2024-01-01T00:00:00Z"}}"#,
        ));
        assert!(blob.manual_swap_table_enabled);
        assert!(!blob.manual_swap_table_started);
        assert!(blob.check_failed_time.get(StepName::FullTransfer).is_some());

        assert_eq!(
            ScheduleTaskResult::from_json(Some("not json")),
            ScheduleTaskResult::default()
        );
    }

    #[test]
    fn parameters_defaults() {
        let p: OscParameters = serde_json::from_str(
            r#"{"databaseName": "db", "tableName": "t", "alterClause": "ADD COLUMN c INT"}"#,
        )
        .unwrap();
        assert_eq!(p.swap_table_type, SwapTableType::Auto);
        assert_eq!(p.swap_table_name_retry_times, 3);
        assert_eq!(p.rate_limit_config, RateLimiterConfig::default());
    }
}
