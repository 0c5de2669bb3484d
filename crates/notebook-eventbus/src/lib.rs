//! In-process fan-out of notebook events to per-document and global
//! subscribers.

pub mod bus;
pub mod envelope;

pub use bus::{
    DEFAULT_DOCUMENT_BUFFER_CAPACITY, DEFAULT_GLOBAL_BUFFER_CAPACITY, NotebookEventBus,
    NotebookEventBusConfig,
};
pub use envelope::NotebookEventEnvelope;
