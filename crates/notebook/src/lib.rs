//! Multi-user notebook runtime: ordered cell storage, per-user execution
//! servers, and kernel sessions that stream output back into the store.

pub use notebook_app::{
    AppError, AppResult, Authorizer, Capability, NotebookRuntime, NotebookService,
    ObjectDirectory, SharedStore, StoreObjectDirectory, StoreObserver, init_tracing,
    shared_store,
};
pub use notebook_config::{
    ConfigError, ENV_NOTEBOOK_CONFIG, JupyterConfigToml, JupyterRuntimeConfig, NotebookConfig,
    default_config_path, load_from_env, load_from_path,
};
pub use notebook_eventbus::{NotebookEventBus, NotebookEventBusConfig, NotebookEventEnvelope};
pub use notebook_kernel::{JupyterClient, KernelSession, KernelSettings, ProcessServer};
pub use notebook_manager::{
    CredentialIssuer, JupyterLauncher, JupyterLauncherConfig, LaunchSpec, LaunchedWorker,
    ManagerSettings, SessionManager, WorkerLauncher, WorkerProcess,
};
pub use notebook_protocol::{
    CELL_DELETE_EVENT, CELL_OUTPUTS_EVENT, CELL_UPDATE_EVENT, CellId, DocumentId, EventPublisher,
    ExecutionServer, KERNEL_STATE_EVENT, KernelChannel, KernelChannelSink, KernelChannelSource,
    KernelId, KernelObserver, KernelState, NotebookEvent, NotebookRuntimeError,
    NotebookRuntimeResult, OutputRecord, UserId,
};
pub use notebook_store::{
    APPEND_INDEX, Cell, CellChange, CellPatch, CellType, SqliteCellStore, StoreError, fixlines,
    normalize,
};
