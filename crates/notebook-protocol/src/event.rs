use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::NotebookRuntimeResult;
use crate::ids::DocumentId;
use crate::kernel::KernelState;

pub const CELL_UPDATE_EVENT: &str = "notebook_cell_update";
pub const CELL_DELETE_EVENT: &str = "notebook_cell_delete";
pub const CELL_OUTPUTS_EVENT: &str = "notebook_cell_outputs";
pub const KERNEL_STATE_EVENT: &str = "notebook_kernel_state";

/// The `{event, object, data}` triple handed to the host's publish call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookEvent {
    pub event: String,
    pub object: DocumentId,
    pub data: Value,
}

impl NotebookEvent {
    pub fn new(event: &str, object: DocumentId, data: Value) -> Self {
        Self {
            event: event.to_owned(),
            object,
            data,
        }
    }

    pub fn kernel_state(object: DocumentId, state: KernelState) -> Self {
        Self::new(KERNEL_STATE_EVENT, object, json!({ "state": state }))
    }
}

/// The host's publish call. Implementations may fail when the target object
/// no longer exists.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: NotebookEvent) -> NotebookRuntimeResult<()>;
}
