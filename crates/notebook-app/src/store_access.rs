use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use notebook_protocol::{DocumentId, NotebookRuntimeError, NotebookRuntimeResult};
use notebook_store::{SqliteCellStore, StoreError};

use crate::access::ObjectDirectory;
use crate::error::{AppError, AppResult};

pub type SharedStore = Arc<Mutex<SqliteCellStore>>;

pub fn shared_store(store: SqliteCellStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Runs one store operation on the blocking pool.
pub(crate) async fn with_store<T, F>(store: &SharedStore, operation: F) -> AppResult<T>
where
    F: FnOnce(&mut SqliteCellStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || {
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        operation(&mut store)
    })
    .await
    .map_err(|error| AppError::internal(format!("store task failed: {error}")))?;
    Ok(result?)
}

/// Keeps modified dates in the store's own `objects` table.
#[derive(Debug, Clone)]
pub struct StoreObjectDirectory {
    store: SharedStore,
}

impl StoreObjectDirectory {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

fn into_runtime(error: AppError) -> NotebookRuntimeError {
    match error {
        AppError::Runtime(error) => error,
        other => NotebookRuntimeError::DependencyUnavailable(other.to_string()),
    }
}

#[async_trait]
impl ObjectDirectory for StoreObjectDirectory {
    async fn modified_date(&self, document_id: &DocumentId) -> NotebookRuntimeResult<Option<String>> {
        let document_id = document_id.clone();
        with_store(&self.store, move |store| store.modified_date(&document_id))
            .await
            .map_err(into_runtime)
    }

    async fn set_modified_date(
        &self,
        document_id: &DocumentId,
        date: &str,
    ) -> NotebookRuntimeResult<()> {
        let document_id = document_id.clone();
        let date = date.to_owned();
        with_store(&self.store, move |store| {
            store.set_modified_date(&document_id, &date)
        })
        .await
        .map_err(into_runtime)
    }
}
