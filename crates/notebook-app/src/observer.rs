use std::sync::Arc;

use async_trait::async_trait;
use notebook_protocol::{
    CellId, DocumentId, EventPublisher, KernelObserver, KernelState, NotebookEvent, OutputRecord,
};
use tracing::{debug, warn};

use crate::store_access::{SharedStore, with_store};

/// Merges kernel output into the cell store and republishes kernel activity
/// as notebook events.
pub struct StoreObserver {
    store: SharedStore,
    publisher: Arc<dyn EventPublisher>,
}

impl StoreObserver {
    pub fn new(store: SharedStore, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }
}

#[async_trait]
impl KernelObserver for StoreObserver {
    async fn on_state_change(&self, document_id: &DocumentId, state: KernelState) {
        // The document may already be gone.
        if let Err(error) = self
            .publisher
            .publish(NotebookEvent::kernel_state(document_id.clone(), state))
            .await
        {
            debug!(
                document = %document_id,
                state = state.as_str(),
                error = %error,
                "dropped kernel state event"
            );
        }
    }

    async fn on_output(&self, document_id: &DocumentId, cell_id: &CellId, output: OutputRecord) {
        let (document, cell) = (document_id.clone(), cell_id.clone());
        let change = match with_store(&self.store, move |store| {
            store.append_output(&document, &cell, output)
        })
        .await
        {
            Ok(change) => change,
            Err(error) => {
                warn!(
                    document = %document_id,
                    cell = %cell_id,
                    error = %error,
                    "failed to store kernel output"
                );
                return;
            }
        };

        if let Err(error) = self.publisher.publish(change.into_event()).await {
            warn!(
                document = %document_id,
                cell = %cell_id,
                error = %error,
                "failed to publish cell outputs"
            );
        }
    }
}
