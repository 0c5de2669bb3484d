use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use notebook_kernel::JupyterClient;
use notebook_protocol::{ExecutionServer, NotebookRuntimeError, NotebookRuntimeResult, UserId};
use tokio::process::{Child, Command};
use tracing::{debug, info};
use uuid::Uuid;

pub const ENV_ACCESS_TOKEN: &str = "NOTEBOOK_ACCESS_TOKEN";
pub const ENV_SERVER_URL: &str = "NOTEBOOK_SERVER_URL";
pub const ENV_IPYTHON_DIR: &str = "IPYTHONDIR";

/// Issues a scoped bearer credential for a user.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, user: &UserId, scope: &str) -> NotebookRuntimeResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub user: UserId,
    pub port: u16,
    pub access_token: String,
}

/// A supervised worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Returns true once the process has exited on its own.
    fn has_exited(&mut self) -> NotebookRuntimeResult<bool>;
    /// Asks the process to stop without waiting for it.
    fn terminate(&mut self) -> NotebookRuntimeResult<()>;
    async fn wait(&mut self) -> NotebookRuntimeResult<()>;
}

pub struct LaunchedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub execution: Arc<dyn ExecutionServer>,
}

impl std::fmt::Debug for LaunchedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedWorker")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> NotebookRuntimeResult<LaunchedWorker>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JupyterLauncherConfig {
    pub executable: PathBuf,
    pub config_file: Option<PathBuf>,
    pub ipython_dir: Option<PathBuf>,
    /// Parent of the per-user notebook directories.
    pub notebook_root: PathBuf,
    pub api_url: String,
    pub extra_args: Vec<String>,
}

/// Starts one notebook server per user, bound to the requested loopback
/// port and protected by a fresh token.
#[derive(Debug, Clone)]
pub struct JupyterLauncher {
    config: JupyterLauncherConfig,
}

impl JupyterLauncher {
    pub fn new(config: JupyterLauncherConfig) -> Self {
        Self { config }
    }

    fn notebook_dir(&self, user: &UserId) -> PathBuf {
        self.config.notebook_root.join(user.as_str())
    }

    fn command(&self, spec: &LaunchSpec, notebook_dir: &std::path::Path, token: &str) -> Command {
        let mut command = Command::new(&self.config.executable);
        if let Some(config_file) = &self.config.config_file {
            command.arg(format!("--config={}", config_file.display()));
        }
        command.arg(format!("--NotebookApp.notebook_dir={}", notebook_dir.display()));
        command.arg(format!("--NotebookApp.port={}", spec.port));
        command.arg(format!("--NotebookApp.token={token}"));
        command.arg("--allow-root");
        command.args(&self.config.extra_args);

        command.env(ENV_ACCESS_TOKEN, &spec.access_token);
        command.env(ENV_SERVER_URL, &self.config.api_url);
        if let Some(ipython_dir) = &self.config.ipython_dir {
            command.env(ENV_IPYTHON_DIR, ipython_dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerLauncher for JupyterLauncher {
    async fn launch(&self, spec: LaunchSpec) -> NotebookRuntimeResult<LaunchedWorker> {
        let notebook_dir = self.notebook_dir(&spec.user);
        tokio::fs::create_dir_all(&notebook_dir)
            .await
            .map_err(|error| {
                NotebookRuntimeError::Configuration(format!(
                    "failed to create notebook directory {}: {error}",
                    notebook_dir.display()
                ))
            })?;

        let token = Uuid::new_v4().simple().to_string();
        let child = self
            .command(&spec, &notebook_dir, &token)
            .spawn()
            .map_err(|error| {
                NotebookRuntimeError::DependencyUnavailable(format!(
                    "failed to start notebook server '{}': {error}",
                    self.config.executable.display()
                ))
            })?;

        info!(
            user = %spec.user,
            port = spec.port,
            pid = child.id(),
            "started notebook server"
        );
        Ok(LaunchedWorker {
            process: Box::new(ChildProcess { child }),
            execution: Arc::new(JupyterClient::for_port(spec.port, Some(token))),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> NotebookRuntimeResult<bool> {
        self.child
            .try_wait()
            .map(|status| status.is_some())
            .map_err(|error| NotebookRuntimeError::Process(format!("worker status check failed: {error}")))
    }

    fn terminate(&mut self) -> NotebookRuntimeResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(error) => Err(NotebookRuntimeError::Process(format!(
                "failed to stop worker: {error}"
            ))),
        }
    }

    async fn wait(&mut self) -> NotebookRuntimeResult<()> {
        let status = self.child.wait().await.map_err(|error| {
            NotebookRuntimeError::Process(format!("failed waiting for worker exit: {error}"))
        })?;
        debug!(pid = self.child.id(), %status, "worker exited");
        Ok(())
    }
}
