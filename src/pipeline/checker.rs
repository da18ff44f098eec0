//! Turns the migration service's per-step report into one verdict.
//!
//! Everything here is pure: no I/O, and the clock is an argument. The
//! reconciliation stage acts on the verdict.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::model::{FullVerificationResult, PrecheckResult, StepFailureTimes, TaskStatus};
use crate::oms::model::{
    FullVerifyResult, ProjectProgress, ProjectStatus, ProjectStep, StepName, StepStatus,
};

const PRECHECK_WEIGHT: f64 = 0.1;
const TRANSFER_WEIGHT_WITH_VERIFY: f64 = 0.4;
const VERIFY_WEIGHT: f64 = 0.4;
const TRANSFER_WEIGHT_WITHOUT_VERIFY: f64 = 0.8;

pub const UNCHECKED_DESCRIPTION: &str = "full verification is disabled, data was not checked";

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStepResult {
    pub precheck_result: Option<PrecheckResult>,
    pub precheck_progress_percentage: f64,
    pub error_msg: Option<String>,
    pub current_step: Option<String>,
    pub current_step_status: Option<String>,
    pub task_status: TaskStatus,
    pub full_transfer_estimated_count: Option<i64>,
    pub full_transfer_finished_count: Option<i64>,
    pub full_transfer_progress_percentage: f64,
    pub full_verification_result: Option<FullVerificationResult>,
    pub full_verification_result_description: Option<String>,
    pub full_verification_progress_percentage: f64,
    pub task_percentage: f64,
    /// Seconds since epoch the incremental sync has reached.
    pub increment_checkpoint: Option<i64>,
    pub project_status: ProjectStatus,
    pub check_failed_time: StepFailureTimes,
    /// A tracked step failed recently enough that resuming is still worth it.
    pub resume_requested: bool,
}

impl ProjectStepResult {
    fn new(progress: &ProjectProgress, failure_times: StepFailureTimes) -> Self {
        Self {
            precheck_result: None,
            precheck_progress_percentage: 0.0,
            error_msg: None,
            current_step: progress.current_step.clone(),
            current_step_status: None,
            task_status: TaskStatus::Running,
            full_transfer_estimated_count: None,
            full_transfer_finished_count: None,
            full_transfer_progress_percentage: 0.0,
            full_verification_result: None,
            full_verification_result_description: None,
            full_verification_progress_percentage: 0.0,
            task_percentage: 0.0,
            increment_checkpoint: progress.incr_sync_checkpoint,
            project_status: progress.status,
            check_failed_time: failure_times,
            resume_requested: false,
        }
    }

    pub fn precheck_failed(&self) -> bool {
        self.precheck_result == Some(PrecheckResult::Failed)
    }

    /// Verification allows the swap (consistent, or not checked at all).
    pub fn verification_accepted(&self) -> bool {
        matches!(
            self.full_verification_result,
            Some(FullVerificationResult::Consistent) | Some(FullVerificationResult::Uncheck)
        )
    }
}

pub struct ProjectStepResultChecker<'a> {
    progress: &'a ProjectProgress,
    steps: HashMap<StepName, &'a ProjectStep>,
    tracked: Vec<StepName>,
    enable_full_verify: bool,
    failed_timeout: Duration,
    failure_times: StepFailureTimes,
    now: DateTime<Utc>,
}

impl<'a> ProjectStepResultChecker<'a> {
    pub fn new(
        progress: &'a ProjectProgress,
        steps: &'a [ProjectStep],
        enable_full_verify: bool,
        failed_timeout: Duration,
        failure_times: StepFailureTimes,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tracked = vec![
            StepName::TransferIncrLogPull,
            StepName::FullTransfer,
            StepName::IncrTransfer,
        ];
        if enable_full_verify {
            tracked.push(StepName::FullVerifier);
        }
        Self {
            progress,
            steps: steps.iter().map(|s| (s.name, s)).collect(),
            tracked,
            enable_full_verify,
            failed_timeout,
            failure_times,
            now,
        }
    }

    pub fn check(mut self) -> ProjectStepResult {
        let mut result =
            ProjectStepResult::new(self.progress, std::mem::take(&mut self.failure_times));
        result.current_step_status = self
            .progress
            .current_step
            .as_deref()
            .map(StepName::parse)
            .and_then(|name| self.steps.get(&name))
            .map(|step| step.status.as_str().to_string());

        self.check_precheck(&mut result);
        if result.precheck_failed() {
            return result;
        }

        let failure = self.scan_failures(&mut result);
        if self.is_finished() {
            result.task_status = TaskStatus::Done;
        } else if self.progress.status.is_destroyed() {
            result.task_status = TaskStatus::Failed;
            if result.error_msg.is_none() {
                result.error_msg = Some(format!(
                    "migration project is {:?}",
                    self.progress.status
                ));
            }
        } else {
            match failure {
                Some(FailureAge::Expired) => result.task_status = TaskStatus::Failed,
                Some(FailureAge::Fresh) => result.resume_requested = true,
                None => {}
            }
        }

        self.fill_transfer(&mut result);
        result.task_percentage = self.task_percentage(&result);
        result
    }

    fn check_precheck(&self, result: &mut ProjectStepResult) {
        let Some(step) = self.steps.get(&StepName::TransferPrecheck) else {
            return;
        };
        match step.status {
            StepStatus::Failed => {
                result.precheck_result = Some(PrecheckResult::Failed);
                result.error_msg = step.error_msg().map(str::to_string);
            }
            StepStatus::Finished => result.precheck_result = Some(PrecheckResult::Finished),
            _ => {}
        }
        if let Some(progress) = step.progress {
            result.precheck_progress_percentage = clamp_percent(progress);
        }
    }

    fn is_finished(&self) -> bool {
        self.progress.status == ProjectStatus::Finished || self.steps_complete()
    }

    fn steps_complete(&self) -> bool {
        self.tracked.iter().all(|name| self.step_finished(*name))
    }

    fn step_finished(&self, name: StepName) -> bool {
        let Some(step) = self.steps.get(&name) else {
            return false;
        };
        let complete = step.progress == Some(100);
        match name {
            StepName::IncrTransfer => step.status == StepStatus::Monitoring && complete,
            // verification keeps running after its first full pass
            StepName::FullVerifier => {
                self.enable_full_verify && step.status == StepStatus::Running && complete
            }
            _ => step.status == StepStatus::Finished && complete,
        }
    }

    /// Updates the failure map and reports the first failed tracked step.
    fn scan_failures(&self, result: &mut ProjectStepResult) -> Option<FailureAge> {
        let mut found = None;
        for name in &self.tracked {
            let failed = self
                .steps
                .get(name)
                .is_some_and(|s| s.status == StepStatus::Failed);
            if !failed {
                result.check_failed_time.clear(*name);
                continue;
            }
            let first_seen = result.check_failed_time.record(*name, self.now);
            if found.is_some() {
                continue;
            }
            result.error_msg = self
                .steps
                .get(name)
                .and_then(|s| s.error_msg())
                .map(str::to_string);
            let elapsed = (self.now - first_seen).to_std().unwrap_or_default();
            found = Some(if elapsed > self.failed_timeout {
                tracing::warn!(
                    step = name.as_str(),
                    elapsed_secs = elapsed.as_secs(),
                    timeout_secs = self.failed_timeout.as_secs(),
                    "step failed beyond timeout"
                );
                FailureAge::Expired
            } else {
                FailureAge::Fresh
            });
        }
        found
    }

    fn fill_transfer(&self, result: &mut ProjectStepResult) {
        if let Some(step) = self.steps.get(&StepName::FullTransfer) {
            if let Some(info) = &step.step_info {
                result.full_transfer_estimated_count = info.capacity;
                result.full_transfer_finished_count = info.processed_records;
            }
            result.full_transfer_progress_percentage = step.progress.map_or(0.0, clamp_percent);
        }
        if self.enable_full_verify {
            if let Some(step) = self.steps.get(&StepName::FullVerifier) {
                result.full_verification_progress_percentage =
                    step.progress.map_or(0.0, clamp_percent);
            }
        }
    }

    fn task_percentage(&self, result: &ProjectStepResult) -> f64 {
        // the weights top out at 90; only complete steps report full
        if self.steps_complete() {
            return 100.0;
        }
        let precheck = PRECHECK_WEIGHT * result.precheck_progress_percentage;
        if self.enable_full_verify {
            precheck
                + TRANSFER_WEIGHT_WITH_VERIFY * result.full_transfer_progress_percentage
                + VERIFY_WEIGHT * result.full_verification_progress_percentage
        } else {
            precheck + TRANSFER_WEIGHT_WITHOUT_VERIFY * result.full_transfer_progress_percentage
        }
    }
}

enum FailureAge {
    Fresh,
    Expired,
}

/// Fills the verification verdict once the task is done. `verify` is the
/// service's report and is only consulted when verification is enabled.
pub fn apply_verification(
    result: &mut ProjectStepResult,
    enable_full_verify: bool,
    verify: Option<&FullVerifyResult>,
) {
    if result.task_status != TaskStatus::Done {
        return;
    }
    if !enable_full_verify {
        result.full_verification_result = Some(FullVerificationResult::Uncheck);
        result.full_verification_result_description = Some(UNCHECKED_DESCRIPTION.to_string());
        return;
    }
    let Some(verify) = verify else {
        return;
    };
    result.full_verification_result = Some(if verify.different_number == Some(0) {
        FullVerificationResult::Consistent
    } else {
        FullVerificationResult::Inconsistent
    });
    if !verify.full_verify_table_statistics.is_empty() {
        let desc: String = verify
            .full_verify_table_statistics
            .iter()
            .filter_map(|s| s.result_desc.as_deref())
            .collect();
        result.full_verification_result_description = Some(desc);
    }
}

fn clamp_percent(p: i32) -> f64 {
    f64::from(p.clamp(0, 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::model::{FullVerifyTableStatistic, StepExtraInfo, StepInfo};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn step(name: StepName, status: StepStatus, progress: i32) -> ProjectStep {
        ProjectStep {
            name,
            status,
            progress: Some(progress),
            extra_info: None,
            step_info: None,
        }
    }

    fn failed(name: StepName, msg: &str) -> ProjectStep {
        ProjectStep {
            extra_info: Some(StepExtraInfo {
                error_code: None,
                error_msg: Some(msg.into()),
            }),
            ..step(name, StepStatus::Failed, 30)
        }
    }

    fn progress(status: ProjectStatus) -> ProjectProgress {
        ProjectProgress {
            status,
            current_step: Some("INCR_TRANSFER".into()),
            incr_sync_checkpoint: Some(1_700_000_000),
        }
    }

    fn all_done(transfer_progress: i32) -> Vec<ProjectStep> {
        vec![
            step(StepName::TransferPrecheck, StepStatus::Finished, 100),
            ProjectStep {
                step_info: Some(StepInfo {
                    capacity: Some(1000),
                    processed_records: Some(1000),
                    incr_timestamp_checkpoint: None,
                }),
                ..step(
                    StepName::FullTransfer,
                    if transfer_progress == 100 {
                        StepStatus::Finished
                    } else {
                        StepStatus::Running
                    },
                    transfer_progress,
                )
            },
            step(StepName::TransferIncrLogPull, StepStatus::Finished, 100),
            step(StepName::IncrTransfer, StepStatus::Monitoring, 100),
        ]
    }

    fn check(
        p: &ProjectProgress,
        steps: &[ProjectStep],
        verify: bool,
        times: StepFailureTimes,
        at: DateTime<Utc>,
    ) -> ProjectStepResult {
        ProjectStepResultChecker::new(p, steps, verify, Duration::from_secs(600), times, at)
            .check()
    }

    #[test]
    fn all_steps_finished_without_verification() {
        let p = progress(ProjectStatus::Running);
        let steps = all_done(100);
        let mut r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Done);
        assert_eq!(r.task_percentage, 100.0);
        assert_eq!(r.precheck_result, Some(PrecheckResult::Finished));
        assert_eq!(r.current_step_status.as_deref(), Some("MONITORING"));
        assert_eq!(r.full_transfer_finished_count, Some(1000));
        assert_eq!(r.increment_checkpoint, Some(1_700_000_000));

        apply_verification(&mut r, false, None);
        assert_eq!(r.full_verification_result, Some(FullVerificationResult::Uncheck));
        assert!(r.verification_accepted());
    }

    #[test]
    fn half_transferred_is_fifty_percent() {
        let p = progress(ProjectStatus::Running);
        let steps = all_done(50);
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Running);
        assert_eq!(r.task_percentage, 50.0);
    }

    #[test]
    fn finished_project_keeps_weighted_percentage() {
        let p = progress(ProjectStatus::Finished);
        let r = check(&p, &all_done(50), false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Done);
        assert_eq!(r.task_percentage, 50.0);
    }

    #[test]
    fn weights_with_verification() {
        let p = progress(ProjectStatus::Running);
        let mut steps = all_done(100);
        steps.push(step(StepName::FullVerifier, StepStatus::Running, 50));
        let r = check(&p, &steps, true, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Running);
        assert_eq!(r.task_percentage, 10.0 + 40.0 + 20.0);
    }

    #[test]
    fn percentages_are_clamped() {
        let p = progress(ProjectStatus::Running);
        let steps = vec![
            step(StepName::TransferPrecheck, StepStatus::Finished, 250),
            step(StepName::FullTransfer, StepStatus::Running, -20),
        ];
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.precheck_progress_percentage, 100.0);
        assert_eq!(r.full_transfer_progress_percentage, 0.0);
        assert_eq!(r.task_percentage, 10.0);
    }

    #[test]
    fn precheck_failure_short_circuits() {
        let p = progress(ProjectStatus::Deleted);
        let steps = vec![
            failed(StepName::TransferPrecheck, "no privilege"),
            failed(StepName::FullTransfer, "other"),
        ];
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert!(r.precheck_failed());
        assert_eq!(r.error_msg.as_deref(), Some("no privilege"));
        assert_eq!(r.task_status, TaskStatus::Running);
        assert!(!r.resume_requested);
        assert!(r.check_failed_time.is_empty());
    }

    #[test]
    fn missing_step_is_not_finished() {
        let p = progress(ProjectStatus::Running);
        let steps: Vec<_> = all_done(100)
            .into_iter()
            .filter(|s| s.name != StepName::IncrTransfer)
            .collect();
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Running);
    }

    #[test]
    fn project_finished_overrides_steps() {
        let p = progress(ProjectStatus::Finished);
        let r = check(&p, &all_done(50), false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Done);
    }

    #[test]
    fn incr_transfer_needs_monitoring() {
        let p = progress(ProjectStatus::Running);
        let mut steps = all_done(100);
        steps[3] = step(StepName::IncrTransfer, StepStatus::Running, 100);
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Running);
    }

    #[test]
    fn fresh_failure_requests_resume_then_expires() {
        let p = progress(ProjectStatus::Running);
        let mut steps = all_done(40);
        steps[1] = failed(StepName::FullTransfer, "writer crashed");

        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Running);
        assert!(r.resume_requested);
        assert_eq!(r.error_msg.as_deref(), Some("writer crashed"));
        assert_eq!(r.check_failed_time.get(StepName::FullTransfer), Some(now()));

        let later = now() + chrono::Duration::seconds(601);
        let r = check(&p, &steps, false, r.check_failed_time, later);
        assert_eq!(r.task_status, TaskStatus::Failed);
        assert!(!r.resume_requested);
        // first-seen time is kept, not refreshed
        assert_eq!(r.check_failed_time.get(StepName::FullTransfer), Some(now()));
    }

    #[test]
    fn recovery_clears_failure_time() {
        let p = progress(ProjectStatus::Running);
        let mut times = StepFailureTimes::new();
        times.record(StepName::FullTransfer, now());
        let r = check(&p, &all_done(60), false, times, now());
        assert!(r.check_failed_time.is_empty());
        assert!(!r.resume_requested);
    }

    #[test]
    fn failed_verifier_ignored_when_disabled() {
        let p = progress(ProjectStatus::Running);
        let mut steps = all_done(100);
        steps.push(failed(StepName::FullVerifier, "verify"));
        let r = check(&p, &steps, false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Done);
        assert!(!r.resume_requested);
    }

    #[test]
    fn destroyed_project_fails() {
        let p = progress(ProjectStatus::Released);
        let r = check(&p, &all_done(60), false, StepFailureTimes::new(), now());
        assert_eq!(r.task_status, TaskStatus::Failed);
        assert!(r.error_msg.is_some());
    }

    #[test]
    fn verification_verdicts() {
        let p = progress(ProjectStatus::Running);
        let mut steps = all_done(100);
        steps.push(step(StepName::FullVerifier, StepStatus::Running, 100));
        let base = check(&p, &steps, true, StepFailureTimes::new(), now());
        assert_eq!(base.task_status, TaskStatus::Done);
        assert_eq!(base.task_percentage, 100.0);

        let stats = vec![
            FullVerifyTableStatistic {
                result_desc: Some("t1 differs;".into()),
                ..Default::default()
            },
            FullVerifyTableStatistic {
                result_desc: Some("t2 differs".into()),
                ..Default::default()
            },
        ];

        let mut r = base.clone();
        apply_verification(
            &mut r,
            true,
            Some(&FullVerifyResult {
                different_number: Some(0),
                full_verify_table_statistics: vec![],
            }),
        );
        assert_eq!(r.full_verification_result, Some(FullVerificationResult::Consistent));

        let mut r = base.clone();
        apply_verification(
            &mut r,
            true,
            Some(&FullVerifyResult {
                different_number: Some(3),
                full_verify_table_statistics: stats,
            }),
        );
        assert_eq!(r.full_verification_result, Some(FullVerificationResult::Inconsistent));
        assert_eq!(
            r.full_verification_result_description.as_deref(),
            Some("t1 differs;t2 differs")
        );
        assert!(!r.verification_accepted());

        let mut r = base.clone();
        apply_verification(&mut r, true, Some(&FullVerifyResult::default()));
        assert_eq!(r.full_verification_result, Some(FullVerificationResult::Inconsistent));
    }

    #[test]
    fn verification_skipped_until_done() {
        let p = progress(ProjectStatus::Running);
        let mut r = check(&p, &all_done(50), false, StepFailureTimes::new(), now());
        apply_verification(&mut r, false, None);
        assert!(r.full_verification_result.is_none());
    }
}
