//! Per-user notebook server processes: launching, readiness, and teardown.

pub mod launcher;
pub mod manager;
pub mod port;

pub use launcher::{
    CredentialIssuer, ENV_ACCESS_TOKEN, ENV_IPYTHON_DIR, ENV_SERVER_URL, JupyterLauncher,
    JupyterLauncherConfig, LaunchSpec, LaunchedWorker, WorkerLauncher, WorkerProcess,
};
pub use manager::{
    DEFAULT_CREDENTIAL_SCOPE, DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, ManagerSettings,
    SessionManager,
};
pub use port::{accepts_connections, allocate_port, wait_until_open};
