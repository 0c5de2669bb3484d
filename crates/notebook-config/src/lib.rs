use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_NOTEBOOK_CONFIG: &str = "NOTEBOOK_CONFIG";

const DEFAULT_API_URL: &str = "http://127.0.0.1:1324";
const DEFAULT_JUPYTER_EXECUTABLE: &str = "jupyter-notebook";
const DEFAULT_KERNEL_NAME: &str = "python3";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_CREDENTIAL_SCOPE: &str = "notebook";
const LOG_FILE_NAME: &str = "notebook.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotebookConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub jupyter: JupyterConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JupyterConfigToml {
    #[serde(default = "default_jupyter_executable")]
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipython_dir: Option<String>,
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_code_path: Option<String>,
    #[serde(default = "default_credential_scope")]
    pub credential_scope: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Settings for launching and talking to per-user notebook servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JupyterRuntimeConfig {
    pub executable: PathBuf,
    pub config_file: Option<PathBuf>,
    pub ipython_dir: Option<PathBuf>,
    pub notebook_root: PathBuf,
    pub api_url: String,
    pub kernel_name: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub init_code_path: Option<PathBuf>,
    pub credential_scope: String,
    pub extra_args: Vec<String>,
}

impl NotebookConfig {
    pub fn jupyter_runtime(&self) -> JupyterRuntimeConfig {
        JupyterRuntimeConfig {
            executable: PathBuf::from(&self.jupyter.executable),
            config_file: self.jupyter.config_file.as_ref().map(PathBuf::from),
            ipython_dir: self.jupyter.ipython_dir.as_ref().map(PathBuf::from),
            notebook_root: Path::new(&self.data_dir).join("notebooks"),
            api_url: self.api_url.clone(),
            kernel_name: self.jupyter.kernel_name.clone(),
            startup_timeout: Duration::from_secs(self.jupyter.startup_timeout_secs),
            poll_interval: Duration::from_millis(self.jupyter.poll_interval_ms),
            init_code_path: self.jupyter.init_code_path.as_ref().map(PathBuf::from),
            credential_scope: self.jupyter.credential_scope.clone(),
            extra_args: self.jupyter.extra_args.clone(),
        }
    }

    /// The log file lives next to the database.
    pub fn log_path(&self) -> PathBuf {
        Path::new(&self.database_path)
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| parent.join(LOG_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(LOG_FILE_NAME))
    }
}

pub fn load_from_env() -> Result<NotebookConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<NotebookConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("notebook").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_NOTEBOOK_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "NOTEBOOK_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_notebook_data_dir() -> PathBuf {
    resolve_data_local_dir().join("notebook")
}

fn resolve_data_local_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("LOCALAPPDATA") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = resolve_home_dir() {
            return home.join("Library").join("Application Support");
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        if let Ok(path) = std::env::var("XDG_DATA_HOME") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join(".local").join("share");
        }
    }

    std::env::temp_dir()
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    std::env::temp_dir().join(path)
}

fn default_database_path() -> String {
    default_notebook_data_dir()
        .join("notebook.db")
        .to_string_lossy()
        .to_string()
}

fn default_data_dir() -> String {
    default_notebook_data_dir().to_string_lossy().to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_owned()
}

fn default_jupyter_executable() -> String {
    DEFAULT_JUPYTER_EXECUTABLE.to_owned()
}

fn default_kernel_name() -> String {
    DEFAULT_KERNEL_NAME.to_owned()
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_credential_scope() -> String {
    DEFAULT_CREDENTIAL_SCOPE.to_owned()
}

impl Default for JupyterConfigToml {
    fn default() -> Self {
        Self {
            executable: default_jupyter_executable(),
            config_file: None,
            ipython_dir: None,
            kernel_name: default_kernel_name(),
            startup_timeout_secs: default_startup_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            init_code_path: None,
            credential_scope: default_credential_scope(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            data_dir: default_data_dir(),
            api_url: default_api_url(),
            verbose: false,
            jupyter: JupyterConfigToml::default(),
        }
    }
}

fn persist_config(path: &Path, config: &NotebookConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize NOTEBOOK_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write NOTEBOOK_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<NotebookConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for NOTEBOOK_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = NotebookConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read NOTEBOOK_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: NotebookConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse NOTEBOOK_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    let changed = normalize_config(&mut config)?;
    if changed {
        persist_config(path, &config)?;
    }

    Ok(config)
}

fn normalize_config(config: &mut NotebookConfig) -> Result<bool, ConfigError> {
    let mut changed = false;

    changed |= normalize_non_empty_string(&mut config.database_path, default_database_path());
    changed |= normalize_non_empty_string(&mut config.data_dir, default_data_dir());
    changed |= normalize_non_empty_string(&mut config.api_url, default_api_url());

    let jupyter = &mut config.jupyter;
    changed |= normalize_non_empty_string(&mut jupyter.executable, default_jupyter_executable());
    changed |= normalize_non_empty_string(&mut jupyter.kernel_name, default_kernel_name());
    changed |= normalize_non_empty_string(
        &mut jupyter.credential_scope,
        default_credential_scope(),
    );
    changed |= normalize_optional_string(&mut jupyter.config_file);
    changed |= normalize_optional_string(&mut jupyter.ipython_dir);
    changed |= normalize_optional_string(&mut jupyter.init_code_path);
    changed |= normalize_string_vec(&mut jupyter.extra_args);

    if jupyter.startup_timeout_secs == 0 {
        return Err(ConfigError::configuration(
            "jupyter.startup_timeout_secs must be greater than zero",
        ));
    }
    if jupyter.poll_interval_ms == 0 {
        return Err(ConfigError::configuration(
            "jupyter.poll_interval_ms must be greater than zero",
        ));
    }

    Ok(changed)
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed.len() != value.len() {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    let Some(current) = value.as_mut() else {
        return false;
    };
    let trimmed = current.trim();
    if trimmed.is_empty() {
        *value = None;
        return true;
    }
    if trimmed.len() != current.len() {
        *current = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_string_vec(values: &mut Vec<String>) -> bool {
    let normalized = values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if *values != normalized {
        *values = normalized;
        return true;
    }
    false
}
