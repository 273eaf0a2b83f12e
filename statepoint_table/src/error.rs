use llvm_stackmaps::ParseError;
use std::collections::TryReserveError;
use thiserror::Error;

/// Why a build failed. Every variant aborts the whole table.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("malformed statepoint record at section offset {offset:#x}: {violation}")]
    FormatViolation { offset: usize, violation: Violation },
    #[error("gc pointer location at section offset {offset:#x} has kind {kind}, expected a stack slot")]
    UnsupportedLocationKind { offset: usize, kind: u8 },
    #[error("derived pointer at {return_address:#x} refers to untracked base at frame offset {base_offset}")]
    MissingBasePointer { return_address: u64, base_offset: i32 },
    #[error("out of memory while building statepoint table")]
    AllocationFailure(#[from] TryReserveError),
    #[error("cannot size a table for {expected} elements at load factor {load_factor}")]
    InvalidTableSize { load_factor: f32, expected: usize },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("leading location {index} is not a constant")]
    LeadingNotConstant { index: usize },
    #[error("only {0} locations, a statepoint has at least 3")]
    TooFewLocations(usize),
    #[error("deopt count is not a constant")]
    DeoptCountNotConstant,
    #[error("negative deopt count {0}")]
    NegativeDeoptCount(i32),
    #[error("deopt count {deopt} exceeds the {remaining} remaining locations")]
    DeoptCountOverflow { deopt: usize, remaining: usize },
    #[error("{0} gc locations do not form base/derived pairs")]
    UnpairedLocations(usize),
    #[error("return address overflows")]
    ReturnAddressOverflow,
}

pub type Result<T> = std::result::Result<T, BuildError>;
