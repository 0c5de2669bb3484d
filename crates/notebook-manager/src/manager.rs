use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use notebook_kernel::{FlightLeader, FlightWaiter, KernelSettings, ProcessServer, flight};
use notebook_protocol::{
    DocumentId, KernelObserver, KernelState, NotebookRuntimeError, NotebookRuntimeResult, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::launcher::{CredentialIssuer, LaunchSpec, WorkerLauncher, WorkerProcess};
use crate::port::{allocate_port, wait_until_open};

pub const DEFAULT_CREDENTIAL_SCOPE: &str = "notebook";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub credential_scope: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub kernel: KernelSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            credential_scope: DEFAULT_CREDENTIAL_SCOPE.to_owned(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            kernel: KernelSettings::default(),
        }
    }
}

struct ManagedServer {
    server: Arc<ProcessServer>,
    process: Box<dyn WorkerProcess>,
}

enum ServerSlot {
    /// `discard` is set when the server is stopped before it finished starting.
    Pending {
        generation: u64,
        waiter: FlightWaiter,
        discard: bool,
    },
    Ready(ManagedServer),
    /// The worker is being stopped; the slot stays occupied until it exits.
    Closing { generation: u64, waiter: FlightWaiter },
}

enum Claim {
    Ready(Arc<ProcessServer>),
    WaitStart(u64, FlightWaiter),
    WaitClose(u64, FlightWaiter),
    Create(u64, FlightLeader),
}

enum CloseAction {
    Stop(ManagedServer, u64, FlightLeader),
    Wait(u64, FlightWaiter),
}

/// Maps users to their worker process and its [`ProcessServer`].
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    launcher: Arc<dyn WorkerLauncher>,
    credentials: Arc<dyn CredentialIssuer>,
    observer: Arc<dyn KernelObserver>,
    settings: ManagerSettings,
    servers: Mutex<HashMap<UserId, ServerSlot>>,
    next_generation: AtomicU64,
    closing: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.shared.settings)
            .field("closing", &self.shared.closing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        credentials: Arc<dyn CredentialIssuer>,
        observer: Arc<dyn KernelObserver>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                launcher,
                credentials,
                observer,
                settings,
                servers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub async fn get(&self, user: &UserId) -> NotebookRuntimeResult<Arc<ProcessServer>> {
        self.get_for(user, None).await
    }

    /// Like [`SessionManager::get`], but announces `starting` for `notify`
    /// when a new server has to be launched.
    ///
    /// The launch runs in its own task: a caller that gives up early leaves
    /// the worker to be published for the next caller, or stopped if it
    /// fails to come up.
    pub async fn get_for(
        &self,
        user: &UserId,
        notify: Option<&DocumentId>,
    ) -> NotebookRuntimeResult<Arc<ProcessServer>> {
        loop {
            if self.shared.closing.load(Ordering::SeqCst) {
                return Err(NotebookRuntimeError::ShuttingDown);
            }

            let claim = {
                let mut servers = self.shared.servers.lock().await;
                match servers.get(user) {
                    Some(ServerSlot::Ready(managed)) => Claim::Ready(Arc::clone(&managed.server)),
                    Some(ServerSlot::Pending {
                        generation, waiter, ..
                    }) => Claim::WaitStart(*generation, waiter.clone()),
                    Some(ServerSlot::Closing { generation, waiter }) => {
                        Claim::WaitClose(*generation, waiter.clone())
                    }
                    None => {
                        let generation = self.shared.next_generation();
                        let (leader, waiter) = flight();
                        servers.insert(
                            user.clone(),
                            ServerSlot::Pending {
                                generation,
                                waiter,
                                discard: false,
                            },
                        );
                        Claim::Create(generation, leader)
                    }
                }
            };

            match claim {
                Claim::Ready(server) => return Ok(server),
                Claim::WaitStart(generation, mut waiter) => {
                    if let Err(reason) = waiter.wait().await {
                        self.shared.release_slot(user, generation).await;
                        return Err(NotebookRuntimeError::Startup(reason));
                    }
                }
                Claim::WaitClose(generation, mut waiter) => {
                    if waiter.wait().await.is_err() {
                        self.shared.release_slot(user, generation).await;
                    }
                }
                Claim::Create(generation, leader) => {
                    let shared = Arc::clone(&self.shared);
                    let (user, notify) = (user.clone(), notify.cloned());
                    let creation = tokio::spawn(async move {
                        shared.create_server(user, notify, generation, leader).await
                    });
                    return creation.await.map_err(|error| {
                        NotebookRuntimeError::Internal(format!(
                            "notebook server setup task failed: {error}"
                        ))
                    })?;
                }
            }
        }
    }

    /// The user's server if it is already running.
    pub async fn existing(&self, user: &UserId) -> Option<Arc<ProcessServer>> {
        match self.shared.servers.lock().await.get(user) {
            Some(ServerSlot::Ready(managed)) => Some(Arc::clone(&managed.server)),
            _ => None,
        }
    }

    /// Reports `off` when the user has no server.
    pub async fn kernel_state(&self, user: &UserId, document_id: &DocumentId) -> KernelState {
        let server = match self.shared.servers.lock().await.get(user) {
            None | Some(ServerSlot::Closing { .. }) => return KernelState::Off,
            Some(ServerSlot::Pending { .. }) => return KernelState::Starting,
            Some(ServerSlot::Ready(managed)) => Arc::clone(&managed.server),
        };
        server.state(document_id).await
    }

    pub async fn close_kernel(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> NotebookRuntimeResult<()> {
        match self.existing(user).await {
            Some(server) => server.close_kernel(document_id).await,
            None => Ok(()),
        }
    }

    /// Stops the user's worker and closes its kernels; absent users are a
    /// no-op. A server still starting is stopped once it is up.
    pub async fn close_server(&self, user: &UserId) -> NotebookRuntimeResult<()> {
        loop {
            let action = {
                let mut servers = self.shared.servers.lock().await;
                let Some(slot) = servers.remove(user) else {
                    return Ok(());
                };
                match slot {
                    ServerSlot::Ready(managed) => {
                        let generation = self.shared.next_generation();
                        let (leader, waiter) = flight();
                        servers.insert(user.clone(), ServerSlot::Closing { generation, waiter });
                        CloseAction::Stop(managed, generation, leader)
                    }
                    ServerSlot::Pending {
                        generation, waiter, ..
                    } => {
                        servers.insert(
                            user.clone(),
                            ServerSlot::Pending {
                                generation,
                                waiter: waiter.clone(),
                                discard: true,
                            },
                        );
                        CloseAction::Wait(generation, waiter)
                    }
                    ServerSlot::Closing { generation, waiter } => {
                        servers.insert(
                            user.clone(),
                            ServerSlot::Closing {
                                generation,
                                waiter: waiter.clone(),
                            },
                        );
                        CloseAction::Wait(generation, waiter)
                    }
                }
            };

            match action {
                CloseAction::Wait(generation, mut waiter) => {
                    if waiter.wait().await.is_err() {
                        self.shared.release_slot(user, generation).await;
                    }
                }
                CloseAction::Stop(managed, generation, leader) => {
                    let shared = Arc::clone(&self.shared);
                    let user = user.clone();
                    let stopping = tokio::spawn(async move {
                        shared.stop_server(user, managed, generation, leader).await
                    });
                    return stopping.await.map_err(|error| {
                        NotebookRuntimeError::Internal(format!(
                            "notebook server stop task failed: {error}"
                        ))
                    })?;
                }
            }
        }
    }

    pub async fn server_count(&self) -> usize {
        self.shared.servers.lock().await.len()
    }

    /// Stops every worker, waits for all of them to exit, then closes every
    /// server. Later `get` calls fail with `ShuttingDown`.
    pub async fn close(&self) -> NotebookRuntimeResult<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let slots: Vec<(UserId, ServerSlot)> = self.shared.servers.lock().await.drain().collect();

        let mut running = Vec::new();
        let mut pending = Vec::new();
        for (user, slot) in slots {
            match slot {
                ServerSlot::Ready(managed) => running.push((user, managed)),
                ServerSlot::Pending { waiter, .. } | ServerSlot::Closing { waiter, .. } => {
                    pending.push(waiter)
                }
            }
        }

        for (user, managed) in &mut running {
            if let Err(error) = managed.process.terminate() {
                warn!(user = %user, error = %error, "failed to stop notebook server");
            }
        }
        join_all(running.iter_mut().map(|(user, managed)| async move {
            if let Err(error) = managed.process.wait().await {
                warn!(user = %user, error = %error, "failed waiting for notebook server");
            }
        }))
        .await;
        join_all(pending.iter_mut().map(|waiter| async move {
            let _ = waiter.wait().await;
        }))
        .await;

        for (user, managed) in running {
            if let Err(error) = managed.server.close().await {
                warn!(user = %user, error = %error, "failed to close notebook server");
            }
        }
        info!("session manager closed");
        Ok(())
    }
}

impl ManagerShared {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    async fn create_server(
        self: Arc<Self>,
        user: UserId,
        notify: Option<DocumentId>,
        generation: u64,
        leader: FlightLeader,
    ) -> NotebookRuntimeResult<Arc<ProcessServer>> {
        if let Some(document_id) = &notify {
            self.observer
                .on_state_change(document_id, KernelState::Starting)
                .await;
        }
        match self.launch_server(&user).await {
            Ok(managed) => self.publish_server(&user, generation, leader, managed).await,
            Err(error) => {
                warn!(user = %user, error = %error, "notebook server failed to start");
                self.release_slot(&user, generation).await;
                leader.fail(error.to_string());
                Err(error)
            }
        }
    }

    async fn launch_server(&self, user: &UserId) -> NotebookRuntimeResult<ManagedServer> {
        let access_token = self
            .credentials
            .issue(user, &self.settings.credential_scope)
            .await?;
        let port = allocate_port().await?;
        debug!(user = %user, port, "launching notebook server");

        let launched = self
            .launcher
            .launch(LaunchSpec {
                user: user.clone(),
                port,
                access_token,
            })
            .await?;
        let mut process = launched.process;

        let ready = wait_until_open(
            port,
            self.settings.startup_timeout,
            self.settings.poll_interval,
            || {
                if self.closing.load(Ordering::SeqCst) {
                    return Err(NotebookRuntimeError::ShuttingDown);
                }
                if process.has_exited()? {
                    return Err(NotebookRuntimeError::Startup(format!(
                        "notebook server for {user} exited during startup"
                    )));
                }
                Ok(())
            },
        )
        .await;
        if let Err(error) = ready {
            stop_process(user, process.as_mut()).await;
            return Err(error);
        }

        let server = ProcessServer::new(
            user.clone(),
            port,
            launched.execution,
            Arc::clone(&self.observer),
            self.settings.kernel.clone(),
        );
        Ok(ManagedServer {
            server: Arc::new(server),
            process,
        })
    }

    async fn publish_server(
        &self,
        user: &UserId,
        generation: u64,
        leader: FlightLeader,
        managed: ManagedServer,
    ) -> NotebookRuntimeResult<Arc<ProcessServer>> {
        let server = Arc::clone(&managed.server);
        let unpublished = {
            let mut servers = self.servers.lock().await;
            let owns_slot = matches!(
                servers.get(user),
                Some(ServerSlot::Pending { generation: current, discard: false, .. })
                    if *current == generation
            );
            if owns_slot && !self.closing.load(Ordering::SeqCst) {
                servers.insert(user.clone(), ServerSlot::Ready(managed));
                None
            } else {
                Some(managed)
            }
        };

        let Some(mut orphan) = unpublished else {
            info!(user = %user, port = server.port(), "notebook server ready");
            leader.complete();
            return Ok(server);
        };

        debug!(user = %user, "notebook server stopped while it was starting");
        stop_process(user, orphan.process.as_mut()).await;
        self.release_slot(user, generation).await;
        leader.fail("notebook server was stopped while starting");
        if self.closing.load(Ordering::SeqCst) {
            return Err(NotebookRuntimeError::ShuttingDown);
        }
        Err(NotebookRuntimeError::Closed(format!(
            "notebook server for {user} was stopped while starting"
        )))
    }

    async fn stop_server(
        self: Arc<Self>,
        user: UserId,
        mut managed: ManagedServer,
        generation: u64,
        leader: FlightLeader,
    ) -> NotebookRuntimeResult<()> {
        info!(user = %user, port = managed.server.port(), "stopping notebook server");
        stop_process(&user, managed.process.as_mut()).await;
        let closed = managed.server.close().await;
        self.release_slot(&user, generation).await;
        leader.complete();
        closed
    }

    /// Removes a pending or closing slot, but only the one tagged `generation`.
    async fn release_slot(&self, user: &UserId, generation: u64) {
        let mut servers = self.servers.lock().await;
        let owned = match servers.get(user) {
            Some(ServerSlot::Pending {
                generation: current,
                ..
            })
            | Some(ServerSlot::Closing {
                generation: current,
                ..
            }) => *current == generation,
            _ => false,
        };
        if owned {
            servers.remove(user);
        }
    }
}

async fn stop_process(user: &UserId, process: &mut dyn WorkerProcess) {
    if let Err(error) = process.terminate() {
        warn!(user = %user, error = %error, "failed to stop notebook server");
    }
    if let Err(error) = process.wait().await {
        warn!(user = %user, error = %error, "failed waiting for notebook server");
    }
}
