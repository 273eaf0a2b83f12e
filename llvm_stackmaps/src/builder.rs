//! Encoder for synthetic stackmap sections, laid out exactly as LLVM emits them.

use crate::stackmap::*;
use byteorder::ByteOrder;
use std::marker::PhantomData;

/// Patch point id LLVM assigns to statepoints by default.
pub const DEFAULT_STATEPOINT_ID: u64 = 0xABCD_EF00;

impl RawLocation {
    pub fn register(reg: u16) -> Self {
        RawLocation {
            kind: LocationKind::Register as u8,
            size: 8,
            reg,
            offset: 0,
        }
    }

    pub fn direct(reg: u16, offset: i32) -> Self {
        RawLocation {
            kind: LocationKind::Direct as u8,
            size: 8,
            reg,
            offset,
        }
    }

    pub fn indirect(reg: u16, offset: i32) -> Self {
        RawLocation {
            kind: LocationKind::Indirect as u8,
            size: 8,
            reg,
            offset,
        }
    }

    pub fn constant(value: i32) -> Self {
        RawLocation {
            kind: LocationKind::Constant as u8,
            size: 8,
            reg: 0,
            offset: value,
        }
    }

    pub fn constant_index(index: i32) -> Self {
        RawLocation {
            kind: LocationKind::ConstantIndex as u8,
            size: 8,
            reg: 0,
            offset: index,
        }
    }
}

pub struct StackMapBuilder<BO: ByteOrder> {
    version: u8,
    functions: Vec<FunctionInfo>,
    constants: Vec<u64>,
    num_records: u32,
    records: Vec<u8>,
    _phantom: PhantomData<BO>,
}

impl<BO: ByteOrder> Default for StackMapBuilder<BO> {
    fn default() -> Self {
        Self::new()
    }
}

impl<BO: ByteOrder> StackMapBuilder<BO> {
    pub fn new() -> Self {
        StackMapBuilder {
            version: STACKMAP_VERSION,
            functions: Vec::new(),
            constants: Vec::new(),
            num_records: 0,
            records: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn version(&mut self, version: u8) -> &mut Self {
        self.version = version;
        self
    }

    pub fn function(&mut self, address: u64, stack_size: u64, callsite_count: u64) -> &mut Self {
        self.functions.push(FunctionInfo {
            address,
            stack_size,
            callsite_count,
        });
        self
    }

    pub fn constant(&mut self, value: u64) -> &mut Self {
        self.constants.push(value);
        self
    }

    /// Appends a statepoint record. Records belong to functions in the order
    /// they were added, following each function's callsite count.
    pub fn callsite(
        &mut self,
        code_offset: u32,
        locations: &[RawLocation],
        live_outs: &[LiveOut],
    ) -> &mut Self {
        let buf = &mut self.records;
        put_u64::<BO>(buf, DEFAULT_STATEPOINT_ID);
        put_u32::<BO>(buf, code_offset);
        put_u16::<BO>(buf, 0);
        put_u16::<BO>(buf, locations.len() as u16);
        for location in locations {
            buf.push(location.kind);
            buf.push(0);
            put_u16::<BO>(buf, location.size);
            put_u16::<BO>(buf, location.reg);
            put_u16::<BO>(buf, 0);
            put_u32::<BO>(buf, location.offset as u32);
        }
        pad(buf);
        put_u16::<BO>(buf, 0);
        put_u16::<BO>(buf, live_outs.len() as u16);
        for live_out in live_outs {
            put_u16::<BO>(buf, live_out.reg);
            buf.push(0);
            buf.push(live_out.size);
        }
        pad(buf);

        self.num_records += 1;
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_SIZE
                + self.functions.len() * FUNCTION_SIZE
                + self.constants.len() * CONSTANT_SIZE
                + self.records.len(),
        );
        buf.push(self.version);
        buf.push(0);
        put_u16::<BO>(&mut buf, 0);
        put_u32::<BO>(&mut buf, self.functions.len() as u32);
        put_u32::<BO>(&mut buf, self.constants.len() as u32);
        put_u32::<BO>(&mut buf, self.num_records);
        for function in &self.functions {
            put_u64::<BO>(&mut buf, function.address);
            put_u64::<BO>(&mut buf, function.stack_size);
            put_u64::<BO>(&mut buf, function.callsite_count);
        }
        for &constant in &self.constants {
            put_u64::<BO>(&mut buf, constant);
        }
        buf.extend_from_slice(&self.records);
        buf
    }
}

fn put_u16<BO: ByteOrder>(buf: &mut Vec<u8>, n: u16) {
    let mut bytes = [0; 2];
    BO::write_u16(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

fn put_u32<BO: ByteOrder>(buf: &mut Vec<u8>, n: u32) {
    let mut bytes = [0; 4];
    BO::write_u32(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

fn put_u64<BO: ByteOrder>(buf: &mut Vec<u8>, n: u64) {
    let mut bytes = [0; 8];
    BO::write_u64(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

fn pad(buf: &mut Vec<u8>) {
    while buf.len() % RECORD_ALIGN != 0 {
        buf.push(0);
    }
}
