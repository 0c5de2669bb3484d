//! Shared kernel runtime protocol: identifiers, states, output records, and
//! the seams between the session layer and the execution server.

pub mod error;
pub mod event;
pub mod ids;
pub mod kernel;
pub mod output;
pub mod server;

pub use error::{NotebookRuntimeError, NotebookRuntimeResult};
pub use event::{
    CELL_DELETE_EVENT, CELL_OUTPUTS_EVENT, CELL_UPDATE_EVENT, EventPublisher, KERNEL_STATE_EVENT,
    NotebookEvent,
};
pub use ids::{CellId, DocumentId, KernelId, UserId};
pub use kernel::{KernelObserver, KernelState};
pub use output::{OutputRecord, OutputType};
pub use server::{ExecutionServer, KernelChannel, KernelChannelSink, KernelChannelSource};

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::error::NotebookRuntimeResult;
    use crate::ids::DocumentId;
    use crate::server::KernelChannelSource;

    struct EmptyChannelSource;

    #[async_trait]
    impl KernelChannelSource for EmptyChannelSource {
        async fn next_text(&mut self) -> NotebookRuntimeResult<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn document_id_round_trips_as_json_string() {
        let document_id = DocumentId::new("obj-1");
        let serialized = serde_json::to_string(&document_id).expect("serialize document id");
        let deserialized: DocumentId =
            serde_json::from_str(&serialized).expect("deserialize document id");

        assert_eq!(serialized, "\"obj-1\"");
        assert_eq!(deserialized, document_id);
    }

    #[test]
    fn channel_source_accepts_trait_objects() {
        let _source: Box<dyn KernelChannelSource> = Box::new(EmptyChannelSource);
    }
}
