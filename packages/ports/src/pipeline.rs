use serde_json::Value;

use crate::types::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task run does not exist or was already resumed. Callers treat this
    /// as benign.
    #[error("callback missing or already resumed")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hook back into the job layer that spawned a transaction: fatally errored
/// transactions resume their pipeline task run with the failure.
#[cfg_attr(feature = "test-helpers", mockall::automock)]
#[async_trait::async_trait]
pub trait PipelineResumer: Send + Sync {
    async fn resume(
        &self,
        task_run_id: Uuid,
        result: std::result::Result<Value, String>,
    ) -> Result<()>;
}
