use serde::Serialize;
use thiserror::Error;

use crate::db::jobs::JobsRepoError;
use crate::engine::catalog::{InputFileError, RawCommandRejected};
use crate::engine::identify::IdentifyError;
use crate::engine::compiler::CompileError;
use crate::offload::OffloadError;
use crate::queue::QueueError;
use crate::reconcile::ReconcileError;
use crate::sandbox::SandboxError;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    NotFound,
    BackendUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Execution(String),
    #[error("{0}")]
    BackendUnavailable(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Jobs(#[from] JobsRepoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RawCommandRejected> for CoreError {
    fn from(value: RawCommandRejected) -> Self {
        Self::Compile(CompileError::Rejected(value))
    }
}

impl From<InputFileError> for CoreError {
    fn from(value: InputFileError) -> Self {
        match value {
            InputFileError::NotFound(_) => Self::NotFound(value.to_string()),
            InputFileError::UnsupportedFormat(_) => Self::Validation(value.to_string()),
        }
    }
}

impl From<IdentifyError> for CoreError {
    fn from(value: IdentifyError) -> Self {
        match value {
            IdentifyError::Compile(error) => Self::Compile(error),
            IdentifyError::Sandbox(error) => Self::Sandbox(error),
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Execution(_) => ErrorKind::Execution,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Compile(CompileError::EngineUnavailable { .. }) => ErrorKind::BackendUnavailable,
            Self::Compile(_) => ErrorKind::Validation,
            Self::Sandbox(SandboxError::Offload(_)) => ErrorKind::Internal,
            Self::Sandbox(_) => ErrorKind::Execution,
            Self::Queue(QueueError::Unavailable(_)) => ErrorKind::BackendUnavailable,
            Self::Queue(_) => ErrorKind::Internal,
            Self::Jobs(JobsRepoError::NotFound) => ErrorKind::NotFound,
            Self::Jobs(JobsRepoError::Validation(_)) => ErrorKind::Validation,
            Self::Jobs(_) => ErrorKind::Internal,
            Self::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Self::Storage(StorageError::OutsideAllowedRoots(_))
            | Self::Storage(StorageError::UnsupportedFormat(_)) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Internal,
            Self::Reconcile(ReconcileError::NotFound(_)) => ErrorKind::NotFound,
            Self::Reconcile(ReconcileError::InvalidState(_)) => ErrorKind::Validation,
            Self::Reconcile(_) => ErrorKind::Internal,
            Self::Offload(_) | Self::Serde(_) => ErrorKind::Internal,
        }
    }
}
