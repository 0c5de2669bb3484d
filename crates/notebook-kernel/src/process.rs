use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use notebook_protocol::{
    DocumentId, ExecutionServer, KernelObserver, KernelState, NotebookRuntimeError,
    NotebookRuntimeResult, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::flight::{FlightLeader, FlightWaiter, flight};
use crate::session::KernelSession;

pub const DEFAULT_KERNEL_NAME: &str = "python3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSettings {
    pub kernel_name: String,
    pub init_code: Option<Arc<str>>,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            kernel_name: DEFAULT_KERNEL_NAME.to_owned(),
            init_code: None,
        }
    }
}

enum KernelSlot {
    /// `discard` is set when the kernel is closed before it finished starting.
    Pending {
        generation: u64,
        waiter: FlightWaiter,
        discard: bool,
    },
    Ready(Arc<KernelSession>),
    /// The backend kernel is being deleted; the slot stays occupied until it is.
    Closing { generation: u64, waiter: FlightWaiter },
}

enum Claim {
    Ready(Arc<KernelSession>),
    WaitStart(u64, FlightWaiter),
    WaitClose(u64, FlightWaiter),
    Create(u64, FlightLeader),
}

enum CloseAction {
    Close(Arc<KernelSession>, u64, FlightLeader),
    Wait(u64, FlightWaiter),
}

/// One user's execution server process and the kernels it hosts, one per
/// document.
pub struct ProcessServer {
    port: u16,
    shared: Arc<ServerShared>,
}

struct ServerShared {
    user: UserId,
    execution: Arc<dyn ExecutionServer>,
    observer: Arc<dyn KernelObserver>,
    settings: KernelSettings,
    kernels: Mutex<HashMap<DocumentId, KernelSlot>>,
    next_generation: AtomicU64,
    closing: AtomicBool,
}

impl std::fmt::Debug for ProcessServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessServer")
            .field("user", &self.shared.user)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ProcessServer {
    pub fn new(
        user: UserId,
        port: u16,
        execution: Arc<dyn ExecutionServer>,
        observer: Arc<dyn KernelObserver>,
        settings: KernelSettings,
    ) -> Self {
        Self {
            port,
            shared: Arc::new(ServerShared {
                user,
                execution,
                observer,
                settings,
                kernels: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.shared.user
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the document's kernel, creating it if needed. Concurrent
    /// callers for the same document share one creation.
    ///
    /// Creation runs in its own task, so a caller that gives up early
    /// neither strands the slot nor leaks the backend kernel.
    pub async fn kernel(&self, document_id: &DocumentId) -> NotebookRuntimeResult<Arc<KernelSession>> {
        loop {
            if self.shared.closing.load(Ordering::SeqCst) {
                return Err(NotebookRuntimeError::ShuttingDown);
            }

            let claim = {
                let mut kernels = self.shared.kernels.lock().await;
                match kernels.get(document_id) {
                    Some(KernelSlot::Ready(session)) => Claim::Ready(Arc::clone(session)),
                    Some(KernelSlot::Pending {
                        generation, waiter, ..
                    }) => Claim::WaitStart(*generation, waiter.clone()),
                    Some(KernelSlot::Closing { generation, waiter }) => {
                        Claim::WaitClose(*generation, waiter.clone())
                    }
                    None => {
                        let generation = self.shared.next_generation();
                        let (leader, waiter) = flight();
                        kernels.insert(
                            document_id.clone(),
                            KernelSlot::Pending {
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
                Claim::Ready(session) => return Ok(session),
                Claim::WaitStart(generation, mut waiter) => {
                    if let Err(reason) = waiter.wait().await {
                        // Clears the slot if its creator went away without signalling.
                        self.shared.release_slot(document_id, generation).await;
                        return Err(NotebookRuntimeError::Startup(reason));
                    }
                }
                Claim::WaitClose(generation, mut waiter) => {
                    if waiter.wait().await.is_err() {
                        self.shared.release_slot(document_id, generation).await;
                    }
                }
                Claim::Create(generation, leader) => {
                    let shared = Arc::clone(&self.shared);
                    let document_id = document_id.clone();
                    let creation = tokio::spawn(async move {
                        shared.create_kernel(document_id, generation, leader).await
                    });
                    return creation.await.map_err(|error| {
                        NotebookRuntimeError::Internal(format!("kernel setup task failed: {error}"))
                    })?;
                }
            }
        }
    }

    /// Deletes the document's backend kernel, then forgets it. Absent
    /// kernels are a no-op; a kernel still starting is discarded once it
    /// exists.
    pub async fn close_kernel(&self, document_id: &DocumentId) -> NotebookRuntimeResult<()> {
        loop {
            let action = {
                let mut kernels = self.shared.kernels.lock().await;
                let Some(slot) = kernels.remove(document_id) else {
                    return Ok(());
                };
                match slot {
                    KernelSlot::Ready(session) => {
                        let generation = self.shared.next_generation();
                        let (leader, waiter) = flight();
                        kernels.insert(
                            document_id.clone(),
                            KernelSlot::Closing { generation, waiter },
                        );
                        CloseAction::Close(session, generation, leader)
                    }
                    KernelSlot::Pending {
                        generation, waiter, ..
                    } => {
                        kernels.insert(
                            document_id.clone(),
                            KernelSlot::Pending {
                                generation,
                                waiter: waiter.clone(),
                                discard: true,
                            },
                        );
                        CloseAction::Wait(generation, waiter)
                    }
                    KernelSlot::Closing { generation, waiter } => {
                        kernels.insert(
                            document_id.clone(),
                            KernelSlot::Closing {
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
                        self.shared.release_slot(document_id, generation).await;
                    }
                }
                CloseAction::Close(session, generation, leader) => {
                    let shared = Arc::clone(&self.shared);
                    let document_id = document_id.clone();
                    let closing = tokio::spawn(async move {
                        shared
                            .finish_close(document_id, session, generation, leader)
                            .await
                    });
                    return closing.await.map_err(|error| {
                        NotebookRuntimeError::Internal(format!("kernel close task failed: {error}"))
                    })?;
                }
            }
        }
    }

    pub async fn interrupt_kernel(&self, document_id: &DocumentId) -> NotebookRuntimeResult<()> {
        let session = match self.shared.kernels.lock().await.get(document_id) {
            Some(KernelSlot::Ready(session)) => Arc::clone(session),
            _ => return Ok(()),
        };
        debug!(user = %self.shared.user, document = %document_id, "interrupting kernel");
        session.interrupt().await
    }

    /// Reports `off` when the document has no kernel.
    pub async fn state(&self, document_id: &DocumentId) -> KernelState {
        match self.shared.kernels.lock().await.get(document_id) {
            None => KernelState::Off,
            Some(KernelSlot::Pending { .. }) => KernelState::Starting,
            Some(KernelSlot::Closing { .. }) => KernelState::Closed,
            Some(KernelSlot::Ready(session)) => session.state(),
        }
    }

    pub async fn kernel_count(&self) -> usize {
        self.shared.kernels.lock().await.len()
    }

    /// Closes every kernel. Later `kernel` calls fail with `ShuttingDown`.
    pub async fn close(&self) -> NotebookRuntimeResult<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let slots: Vec<(DocumentId, KernelSlot)> =
            self.shared.kernels.lock().await.drain().collect();

        for (document_id, slot) in slots {
            match slot {
                KernelSlot::Ready(session) => {
                    if let Err(error) = session.close().await {
                        warn!(
                            user = %self.shared.user,
                            document = %document_id,
                            error = %error,
                            "kernel close failed during server shutdown"
                        );
                    }
                }
                KernelSlot::Pending { mut waiter, .. } | KernelSlot::Closing { mut waiter, .. } => {
                    let _ = waiter.wait().await;
                }
            }
        }
        debug!(user = %self.shared.user, port = self.port, "process server closed");
        Ok(())
    }
}

impl ServerShared {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    async fn create_kernel(
        self: Arc<Self>,
        document_id: DocumentId,
        generation: u64,
        leader: FlightLeader,
    ) -> NotebookRuntimeResult<Arc<KernelSession>> {
        let kernel_id = match self.execution.create_kernel(&self.settings.kernel_name).await {
            Ok(kernel_id) => kernel_id,
            Err(error) => {
                self.release_slot(&document_id, generation).await;
                leader.fail(error.to_string());
                return Err(error);
            }
        };

        info!(
            user = %self.user,
            document = %document_id,
            kernel = %kernel_id,
            "started kernel"
        );
        let session = KernelSession::start(
            Arc::clone(&self.execution),
            kernel_id,
            document_id.clone(),
            Arc::clone(&self.observer),
            self.settings.init_code.clone(),
        );

        let published = {
            let mut kernels = self.kernels.lock().await;
            let owns_slot = matches!(
                kernels.get(&document_id),
                Some(KernelSlot::Pending { generation: current, discard: false, .. })
                    if *current == generation
            );
            if owns_slot && !self.closing.load(Ordering::SeqCst) {
                kernels.insert(document_id.clone(), KernelSlot::Ready(Arc::clone(&session)));
                true
            } else {
                false
            }
        };

        if published {
            leader.complete();
            return Ok(session);
        }

        debug!(
            user = %self.user,
            document = %document_id,
            "kernel closed while it was starting"
        );
        // The slot stays pending until the backend kernel is gone.
        let closed = session.close().await;
        self.release_slot(&document_id, generation).await;
        leader.fail("kernel was closed while starting");
        closed?;
        Err(NotebookRuntimeError::Closed(format!(
            "kernel for document {document_id} was closed while starting"
        )))
    }

    async fn finish_close(
        self: Arc<Self>,
        document_id: DocumentId,
        session: Arc<KernelSession>,
        generation: u64,
        leader: FlightLeader,
    ) -> NotebookRuntimeResult<()> {
        info!(user = %self.user, document = %document_id, "closing kernel");
        let closed = session.close().await;
        self.release_slot(&document_id, generation).await;
        leader.complete();
        closed
    }

    /// Removes a pending or closing slot, but only the one tagged `generation`.
    async fn release_slot(&self, document_id: &DocumentId, generation: u64) {
        let mut kernels = self.kernels.lock().await;
        let owned = match kernels.get(document_id) {
            Some(KernelSlot::Pending {
                generation: current,
                ..
            })
            | Some(KernelSlot::Closing {
                generation: current,
                ..
            }) => *current == generation,
            _ => false,
        };
        if owned {
            kernels.remove(document_id);
        }
    }
}
