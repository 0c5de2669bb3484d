use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotebookRuntimeError {
    #[error("notebook runtime configuration error: {0}")]
    Configuration(String),
    #[error("notebook runtime dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("notebook runtime kernel not found: {0}")]
    KernelNotFound(String),
    #[error("notebook runtime process error: {0}")]
    Process(String),
    #[error("notebook runtime protocol error: {0}")]
    Protocol(String),
    #[error("notebook runtime startup failed: {0}")]
    Startup(String),
    #[error("notebook runtime resource closed: {0}")]
    Closed(String),
    #[error("notebook runtime is shutting down")]
    ShuttingDown,
    #[error("notebook runtime internal error: {0}")]
    Internal(String),
}

pub type NotebookRuntimeResult<T> = Result<T, NotebookRuntimeError>;
