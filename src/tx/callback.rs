//! Resume callback invoked when a tx that suspended an external run finishes

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResumeError {
    /// The run no longer exists; nothing left to resume
    #[error("pipeline run {0} not found")]
    NotFound(Uuid),

    #[error("resume failed: {0}")]
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResumeCallback: Send + Sync {
    /// `result` carries the receipt JSON on success, `error` the failure reason
    async fn resume(
        &self,
        pipeline_task_run_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), ResumeError>;
}
