//! Return address → frame descriptor lookup for precise stack scanning.
//!
//! [`build_table`] reads the statepoint records of an LLVM stackmap section
//! and packs one [`FrameDescriptor`] per safepoint into a
//! [`StatepointTable`]. While walking the stack during a collection, the
//! runtime looks each return address up to learn the frame size and which
//! frame slots hold base and derived pointers.
//!
//! The table is built once and then only read, so it can be shared between
//! threads.

mod config;
mod driver;
mod error;
mod frame;
mod table;

pub use config::{TableConfig, DEFAULT_LOAD_FACTOR};
pub use driver::{build_table, build_table_with};
pub use error::{BuildError, Result, Violation};
pub use frame::{FrameDescriptor, FrameRef, PointerSlot, SlotKind};
pub use table::StatepointTable;
