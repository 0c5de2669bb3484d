use notebook_protocol::{CellId, DocumentId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("cell '{cell_id}' not found in document '{document_id}'")]
    CellNotFound {
        document_id: DocumentId,
        cell_id: CellId,
    },
    #[error("unsupported schema version {found}; newest supported version is {supported}")]
    UnsupportedSchemaVersion { supported: u32, found: u32 },
}

impl StoreError {
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::Validation(err.to_string()),
            _ => Self::Persistence(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
