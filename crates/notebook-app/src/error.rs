use notebook_config::ConfigError;
use notebook_protocol::{CellId, DocumentId, NotebookRuntimeError, UserId};
use notebook_store::StoreError;
use thiserror::Error;

use crate::access::Capability;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("user '{user}' may not {capability} document '{document_id}'")]
    PermissionDenied {
        user: UserId,
        document_id: DocumentId,
        capability: Capability,
    },
    #[error("submitted source for cell '{cell_id}' does not match the stored source")]
    SourceMismatch {
        document_id: DocumentId,
        cell_id: CellId,
    },
    #[error("setting non-empty outputs is not permitted")]
    OutputsNotPermitted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] NotebookRuntimeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
