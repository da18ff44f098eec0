//! Row views returned by the store.

use serde::{Deserialize, Serialize};

/// Periodic poll registration for one schedule. Only one exists per schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTrigger {
    pub schedule_id: i64,
    pub schedule_task_id: i64,
    #[serde(default)]
    pub oms_project_id: Option<String>,
}

