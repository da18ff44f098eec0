use thiserror::Error;

use crate::oms::OmsError;

#[derive(Debug, Error)]
pub enum OscError {
    #[error("failed to create data source: {0}")]
    DataSourceCreation(String),
    #[error("data source id must not be null")]
    MissingDataSourceId,
    #[error("precheck failed: {0}")]
    PrecheckFailed(String),
    #[error("migration project failed: {0}")]
    ExecutionFailed(String),
    #[error("full verification found inconsistent data: {0}")]
    DataInconsistent(String),
    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),
    #[error("no stage registered in pipeline")]
    NoStageRegistered,
    #[error(transparent)]
    Oms(#[from] OmsError),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OscError {
    /// Fatal errors end the job; everything else is retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OscError::DataSourceCreation(_)
                | OscError::MissingDataSourceId
                | OscError::PrecheckFailed(_)
                | OscError::ExecutionFailed(_)
                | OscError::DataInconsistent(_)
                | OscError::InvalidParameters(_)
                | OscError::NoStageRegistered
        )
    }

    pub fn storage(err: anyhow::Error) -> Self {
        OscError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(OscError::PrecheckFailed("x".into()).is_fatal());
        assert!(OscError::DataInconsistent("x".into()).is_fatal());
        assert!(OscError::NoStageRegistered.is_fatal());
        assert!(OscError::InvalidParameters("x".into()).is_fatal());
        assert!(!OscError::Oms(OmsError::EmptyData("CreateProject")).is_fatal());
        assert!(!OscError::storage(anyhow::anyhow!("locked")).is_fatal());
    }
}
