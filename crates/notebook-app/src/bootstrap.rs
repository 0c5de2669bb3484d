use std::path::Path;
use std::sync::Arc;

use notebook_config::{ConfigError, JupyterRuntimeConfig, NotebookConfig};
use notebook_eventbus::NotebookEventBus;
use notebook_kernel::KernelSettings;
use notebook_manager::{
    CredentialIssuer, JupyterLauncher, JupyterLauncherConfig, ManagerSettings, SessionManager,
};
use notebook_store::SqliteCellStore;
use tracing::info;

use crate::access::Authorizer;
use crate::error::{AppError, AppResult};
use crate::observer::StoreObserver;
use crate::service::NotebookService;
use crate::store_access::{SharedStore, StoreObjectDirectory, shared_store};

/// Routes `tracing` output to `notebook.log` beside the database.
pub fn init_tracing(config: &NotebookConfig) -> AppResult<()> {
    let log_path = config.log_path();
    create_parent_dir(&log_path, "log")?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|error| {
            configuration(format!(
                "failed to open notebook log file '{}': {error}",
                log_path.display()
            ))
        })?;

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .try_init()
        .map_err(|error| AppError::internal(format!("failed to install tracing: {error}")))
}

/// Everything the host needs to serve notebooks, wired from configuration.
pub struct NotebookRuntime {
    pub service: Arc<NotebookService>,
    pub events: Arc<NotebookEventBus>,
    pub store: SharedStore,
}

impl std::fmt::Debug for NotebookRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookRuntime")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl NotebookRuntime {
    pub fn from_config(
        config: &NotebookConfig,
        authorizer: Arc<dyn Authorizer>,
        credentials: Arc<dyn CredentialIssuer>,
    ) -> AppResult<Self> {
        let database_path = Path::new(config.database_path.as_str());
        create_parent_dir(database_path, "database")?;
        let store = shared_store(SqliteCellStore::open(database_path)?);

        let jupyter = config.jupyter_runtime();
        let settings = manager_settings(&jupyter)?;
        let launcher = JupyterLauncher::new(JupyterLauncherConfig {
            executable: jupyter.executable,
            config_file: jupyter.config_file,
            ipython_dir: jupyter.ipython_dir,
            notebook_root: jupyter.notebook_root,
            api_url: jupyter.api_url,
            extra_args: jupyter.extra_args,
        });

        let events = Arc::new(NotebookEventBus::default());
        let observer = Arc::new(StoreObserver::new(Arc::clone(&store), events.clone()));
        let manager = Arc::new(SessionManager::new(
            Arc::new(launcher),
            credentials,
            observer,
            settings,
        ));
        let directory = Arc::new(StoreObjectDirectory::new(Arc::clone(&store)));
        let service = Arc::new(NotebookService::new(
            Arc::clone(&store),
            manager,
            events.clone(),
            authorizer,
            directory,
        ));

        info!(database = %database_path.display(), "notebook runtime ready");
        Ok(Self {
            service,
            events,
            store,
        })
    }
}

fn manager_settings(jupyter: &JupyterRuntimeConfig) -> AppResult<ManagerSettings> {
    let init_code = match &jupyter.init_code_path {
        Some(path) => {
            let code = std::fs::read_to_string(path).map_err(|error| {
                configuration(format!(
                    "failed to read kernel init code '{}': {error}",
                    path.display()
                ))
            })?;
            Some(Arc::from(code))
        }
        None => None,
    };

    Ok(ManagerSettings {
        credential_scope: jupyter.credential_scope.clone(),
        startup_timeout: jupyter.startup_timeout,
        poll_interval: jupyter.poll_interval,
        kernel: KernelSettings {
            kernel_name: jupyter.kernel_name.clone(),
            init_code,
        },
    })
}

fn create_parent_dir(path: &Path, what: &str) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                configuration(format!(
                    "failed to create notebook {what} directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}

fn configuration(message: String) -> AppError {
    AppError::Config(ConfigError::Message(message))
}
