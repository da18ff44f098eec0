//! Ordered stage chain driving one schedule task.
//!
//! A pipeline holds intermediate stages followed by one terminal ("basic")
//! stage. Each stage decides on its own whether to hand over to the rest of
//! the chain through [`Next`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::OscError;
use crate::model::{ConnectionConfig, OscParameters, Schedule, ScheduleTask, TaskParameters};

pub mod check_project;
pub mod checker;
pub mod create_project;
pub mod swap_table;
pub mod wait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageId {
    CreateProject,
    CheckProject,
    SwapTable,
}

/// State threaded through one pipeline invocation.
#[derive(Debug, Clone)]
pub struct OscContext {
    pub schedule: Schedule,
    pub schedule_task: ScheduleTask,
    pub task_parameters: TaskParameters,
    pub parameters: OscParameters,
    pub connection_config: ConnectionConfig,
    swap_succeeded: bool,
}

impl OscContext {
    pub fn new(
        schedule: Schedule,
        schedule_task: ScheduleTask,
        connection_config: ConnectionConfig,
    ) -> Self {
        Self {
            task_parameters: schedule_task.parameters.clone(),
            parameters: schedule.job_parameters.clone(),
            schedule,
            schedule_task,
            connection_config,
            swap_succeeded: false,
        }
    }

    pub fn swap_succeeded(&self) -> bool {
        self.swap_succeeded
    }

    pub(crate) fn mark_swap_succeeded(&mut self) {
        self.swap_succeeded = true;
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn invoke(&self, ctx: &mut OscContext, next: Next<'_>) -> Result<(), OscError>;
}

/// Invoked once the terminal stage completed the swap.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_complete(&self, ctx: &OscContext) -> Result<(), OscError>;
}

/// The part of the chain after the running stage.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub async fn invoke(self, ctx: &mut OscContext) -> Result<(), OscError> {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.invoke(ctx, Next { rest }).await,
            None => Ok(()),
        }
    }

    pub fn is_end(&self) -> bool {
        self.rest.is_empty()
    }
}

#[derive(Default, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    basic: Option<Arc<dyn Stage>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_ids()).finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a stage right before the terminal one.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Replaces the terminal stage.
    pub fn set_basic(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.basic = Some(stage);
        self
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.chain().iter().map(|s| s.id()).collect()
    }

    fn chain(&self) -> Vec<Arc<dyn Stage>> {
        self.stages.iter().chain(self.basic.iter()).cloned().collect()
    }

    pub async fn invoke(&self, ctx: &mut OscContext) -> Result<(), OscError> {
        let chain = self.chain();
        if chain.is_empty() {
            return Err(OscError::NoStageRegistered);
        }
        Next { rest: &chain }.invoke(ctx).await
    }
}
