//! Kernel sessions over a notebook execution server: the REST and channel
//! client, per-document sessions, and the per-user process server that owns
//! them.

pub mod client;
pub mod flight;
pub mod process;
pub mod session;
pub mod wire;

pub use client::JupyterClient;
pub use flight::{FlightLeader, FlightWaiter, flight};
pub use process::{DEFAULT_KERNEL_NAME, KernelSettings, ProcessServer};
pub use session::KernelSession;
pub use wire::{KernelMessage, cell_from_correlation, correlation_id, decode_message};
