//! Ordered notebook cell persistence and streamed-output normalization.

pub mod cell;
pub mod change;
pub mod error;
pub mod normalize;
pub mod outputs;
mod sqlite_impl;

pub use cell::{APPEND_INDEX, Cell, CellPatch, CellType};
pub use change::CellChange;
pub use error::StoreError;
pub use normalize::{fixlines, normalize};
pub use outputs::merge_output;
pub use sqlite_impl::SqliteCellStore;
