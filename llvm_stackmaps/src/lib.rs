//! Reader for the stackmap sections LLVM emits for patchpoints and statepoints
//! (format version 3, `.llvm_stackmaps` / `__llvm_stackmaps`).
//!
//! Nothing is copied out of the section: [`StackMapReader`] hands out views
//! that borrow the input bytes and bounds-check every read.

#[cfg(any(test, feature = "builder"))]
mod builder;
mod parser;
mod stackmap;

#[cfg(any(test, feature = "builder"))]
pub use builder::*;
pub use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian};
pub use parser::*;
pub use stackmap::*;
