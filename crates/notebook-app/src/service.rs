use std::sync::Arc;

use notebook_manager::SessionManager;
use notebook_protocol::{CellId, DocumentId, EventPublisher, KernelState, UserId};
use notebook_store::{Cell, CellChange, CellPatch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{Authorizer, Capability, ObjectDirectory};
use crate::error::{AppError, AppResult};
use crate::store_access::{SharedStore, with_store};

/// The notebook operations exposed to the host's request router.
pub struct NotebookService {
    store: SharedStore,
    manager: Arc<SessionManager>,
    publisher: Arc<dyn EventPublisher>,
    authorizer: Arc<dyn Authorizer>,
    directory: Arc<dyn ObjectDirectory>,
}

impl std::fmt::Debug for NotebookService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookService")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl NotebookService {
    pub fn new(
        store: SharedStore,
        manager: Arc<SessionManager>,
        publisher: Arc<dyn EventPublisher>,
        authorizer: Arc<dyn Authorizer>,
        directory: Arc<dyn ObjectDirectory>,
    ) -> Self {
        Self {
            store,
            manager,
            publisher,
            authorizer,
            directory,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn read(&self, user: &UserId, document_id: &DocumentId) -> AppResult<Vec<Cell>> {
        self.authorize(user, document_id, Capability::Read).await?;
        let document = document_id.clone();
        with_store(&self.store, move |store| store.read(&document)).await
    }

    pub async fn read_cell(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        cell_id: &CellId,
    ) -> AppResult<Cell> {
        self.authorize(user, document_id, Capability::Read).await?;
        self.load_cell(document_id, cell_id).await
    }

    /// Applies a client batch atomically and publishes one event per
    /// touched cell. Clients may clear outputs but never write them.
    pub async fn save(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        patches: Vec<CellPatch>,
    ) -> AppResult<Vec<CellChange>> {
        self.authorize(user, document_id, Capability::Write).await?;
        if patches.iter().any(CellPatch::has_outputs) {
            return Err(AppError::OutputsNotPermitted);
        }

        let document = document_id.clone();
        let changes =
            with_store(&self.store, move |store| store.apply_batch(&document, patches)).await?;
        for change in &changes {
            self.publish(change.clone()).await;
        }
        self.touch_modified_date(document_id).await?;
        Ok(changes)
    }

    /// Runs a code cell after checking the submitted source against the
    /// stored one. Other cell types are accepted and ignored.
    pub async fn run_cell(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        cell_id: &CellId,
        source: &str,
    ) -> AppResult<()> {
        self.authorize(user, document_id, Capability::Run).await?;
        let cell = self.load_cell(document_id, cell_id).await?;
        if cell.source != source {
            warn!(document = %document_id, cell = %cell_id, "cell source does not match");
            return Err(AppError::SourceMismatch {
                document_id: document_id.clone(),
                cell_id: cell_id.clone(),
            });
        }
        if !cell.cell_type.is_code() {
            return Ok(());
        }

        info!(user = %user, document = %document_id, cell = %cell_id, "running cell");
        let (document, cell_key) = (document_id.clone(), cell_id.clone());
        let cleared = with_store(&self.store, move |store| {
            store.clear_outputs(&document, &cell_key)
        })
        .await?;
        self.publish(cleared).await;

        let server = self.manager.get_for(user, Some(document_id)).await?;
        let kernel = server.kernel(document_id).await?;
        kernel.run(cell_id, &cell.source).await?;
        Ok(())
    }

    /// Reports the document's kernel state, starting the kernel first when
    /// `start` is set.
    pub async fn kernel_state(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        start: bool,
    ) -> AppResult<KernelState> {
        self.authorize(user, document_id, Capability::Run).await?;
        if start {
            return self.start_kernel_authorized(user, document_id).await;
        }
        Ok(self.manager.kernel_state(user, document_id).await)
    }

    pub async fn start_kernel(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> AppResult<KernelState> {
        self.authorize(user, document_id, Capability::Run).await?;
        self.start_kernel_authorized(user, document_id).await
    }

    pub async fn stop_kernel(&self, user: &UserId, document_id: &DocumentId) -> AppResult<()> {
        self.authorize(user, document_id, Capability::Run).await?;
        self.manager.close_kernel(user, document_id).await?;
        Ok(())
    }

    /// Interrupts a running kernel; does nothing when the user has no server.
    pub async fn interrupt_kernel(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> AppResult<()> {
        self.authorize(user, document_id, Capability::Run).await?;
        if let Some(server) = self.manager.existing(user).await {
            server.interrupt_kernel(document_id).await?;
        }
        Ok(())
    }

    /// Closes the document's kernel in the background.
    pub fn on_object_deleted(&self, user: UserId, document_id: DocumentId) -> JoinHandle<()> {
        debug!(user = %user, document = %document_id, "notebook deleted");
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            if let Err(error) = manager.close_kernel(&user, &document_id).await {
                warn!(
                    user = %user,
                    document = %document_id,
                    error = %error,
                    "failed to close kernel of deleted notebook"
                );
            }
        })
    }

    /// Stops the user's server in the background.
    pub fn on_user_deleted(&self, user: UserId) -> JoinHandle<()> {
        debug!(user = %user, "user deleted");
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            if let Err(error) = manager.close_server(&user).await {
                warn!(user = %user, error = %error, "failed to stop server of deleted user");
            }
        })
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        info!("shutting down notebook service");
        self.manager.close().await?;
        Ok(())
    }

    async fn start_kernel_authorized(
        &self,
        user: &UserId,
        document_id: &DocumentId,
    ) -> AppResult<KernelState> {
        let server = self.manager.get_for(user, Some(document_id)).await?;
        let kernel = server.kernel(document_id).await?;
        Ok(kernel.state())
    }

    async fn authorize(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        capability: Capability,
    ) -> AppResult<()> {
        if self
            .authorizer
            .has_access(user, document_id, capability)
            .await?
        {
            return Ok(());
        }
        Err(AppError::PermissionDenied {
            user: user.clone(),
            document_id: document_id.clone(),
            capability,
        })
    }

    async fn load_cell(&self, document_id: &DocumentId, cell_id: &CellId) -> AppResult<Cell> {
        let (document, cell) = (document_id.clone(), cell_id.clone());
        with_store(&self.store, move |store| store.read_cell(&document, &cell)).await
    }

    async fn publish(&self, change: CellChange) {
        let document_id = change.document_id().clone();
        if let Err(error) = self.publisher.publish(change.into_event()).await {
            warn!(document = %document_id, error = %error, "failed to publish cell event");
        }
    }

    async fn touch_modified_date(&self, document_id: &DocumentId) -> AppResult<()> {
        let today = with_store(&self.store, |store| store.current_utc_date()).await?;
        let current = self.directory.modified_date(document_id).await?;
        if current.as_deref() != Some(today.as_str()) {
            debug!(document = %document_id, date = %today, "updating modification date");
            self.directory.set_modified_date(document_id, &today).await?;
        }
        Ok(())
    }
}
