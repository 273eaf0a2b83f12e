use crate::parser::ParseError;

/// The only stackmap format version this crate understands.
pub const STACKMAP_VERSION: u8 = 3;

pub const HEADER_SIZE: usize = 16;
pub const FUNCTION_SIZE: usize = 24;
pub const CONSTANT_SIZE: usize = 8;
pub const CALLSITE_HEADER_SIZE: usize = 16;
pub const LOCATION_SIZE: usize = 12;
pub const LIVEOUT_HEADER_SIZE: usize = 4;
pub const LIVEOUT_SIZE: usize = 4;

/// Callsite records, and the liveout header inside each, start on this boundary.
pub const RECORD_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub num_functions: u32,
    pub num_constants: u32,
    pub num_records: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    pub address: u64,
    pub stack_size: u64,
    pub callsite_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocationKind {
    Register = 0x01,
    Direct = 0x02,
    Indirect = 0x03,
    Constant = 0x04,
    ConstantIndex = 0x05,
}

impl TryFrom<u8> for LocationKind {
    type Error = ParseError;

    fn try_from(kind: u8) -> Result<Self, ParseError> {
        Ok(match kind {
            0x01 => LocationKind::Register,
            0x02 => LocationKind::Direct,
            0x03 => LocationKind::Indirect,
            0x04 => LocationKind::Constant,
            0x05 => LocationKind::ConstantIndex,
            unsupported => return Err(ParseError::UnsupportedLocationType(unsupported)),
        })
    }
}

/// One location entry exactly as encoded. The kind byte is kept raw so that
/// locations nobody interprets (deopt arguments) never fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLocation {
    pub kind: u8,
    pub size: u16,
    pub reg: u16,
    pub offset: i32,
}

impl RawLocation {
    pub fn kind(&self) -> Result<LocationKind, ParseError> {
        LocationKind::try_from(self.kind)
    }

    pub fn is(&self, kind: LocationKind) -> bool {
        self.kind == kind as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOut {
    pub reg: u16,
    pub size: u8,
}

pub(crate) fn align_up(pos: usize) -> Option<usize> {
    pos.checked_add(RECORD_ALIGN - 1)
        .map(|p| p & !(RECORD_ALIGN - 1))
}
