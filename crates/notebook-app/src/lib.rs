//! The notebook operations a host exposes to clients, wired over the cell
//! store, the event bus, and the per-user session manager.

pub mod access;
pub mod bootstrap;
pub mod error;
pub mod observer;
pub mod service;
pub mod store_access;

pub use access::{Authorizer, Capability, ObjectDirectory};
pub use bootstrap::{NotebookRuntime, init_tracing};
pub use error::{AppError, AppResult};
pub use observer::StoreObserver;
pub use service::NotebookService;
pub use store_access::{SharedStore, StoreObjectDirectory, shared_store};
