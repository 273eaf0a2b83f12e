use crate::stackmap::*;
use byteorder::ByteOrder;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("cannot parse stackmap format version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpectedly hit end of input data while reading {len} bytes at offset {offset}")]
    BufferTruncated { offset: usize, len: usize },
    #[error("read unsupported location type {0}")]
    UnsupportedLocationType(u8),
    #[error("found {actual} records, but functions expect {functions_sum}")]
    BadRecordCount { actual: u64, functions_sum: u64 },
    #[error("section offset arithmetic overflowed")]
    OffsetOverflow,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Bounds-checked read position over a stackmap section.
struct Cursor<'a, BO: ByteOrder> {
    data: &'a [u8],
    pos: usize,
    _phantom: PhantomData<BO>,
}

impl<'a, BO: ByteOrder> Cursor<'a, BO> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Cursor {
            data,
            pos,
            _phantom: PhantomData,
        }
    }

    fn read_n(&mut self, n: usize) -> Result<&'a [u8]> {
        let truncated = ParseError::BufferTruncated {
            offset: self.pos,
            len: n,
        };
        let new_pos = self.pos.checked_add(n).ok_or(ParseError::OffsetOverflow)?;
        let res = self.data.get(self.pos..new_pos).ok_or(truncated)?;
        self.pos = new_pos;
        Ok(res)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.read_n(n).map(drop)
    }

    fn skip_array(&mut self, count: usize, stride: usize) -> Result<()> {
        let len = count
            .checked_mul(stride)
            .ok_or(ParseError::OffsetOverflow)?;
        self.skip(len)
    }

    // moves the position only, trailing padding may be cut off at the end of the section
    fn realign(&mut self) -> Result<()> {
        self.pos = align_up(self.pos).ok_or(ParseError::OffsetOverflow)?;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_n(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(BO::read_u16(self.read_n(2)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(BO::read_u32(self.read_n(4)?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(BO::read_u64(self.read_n(8)?))
    }
}

/// Zero-copy view of an LLVM stackmap (version 3) section.
///
/// Construction checks the header, the function array and the constant pool.
/// Callsite records are only opened on demand, each one bounds-checked as it
/// is reached.
pub struct StackMapReader<'a, BO: ByteOrder> {
    data: &'a [u8],
    header: Header,
    functions_offset: usize,
    constants_offset: usize,
    callsites_offset: usize,
    _phantom: PhantomData<BO>,
}

impl<'a, BO: ByteOrder + 'a> StackMapReader<'a, BO> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut cur = Cursor::<BO>::at(data, 0);

        let version = cur.read_u8()?;
        if version != STACKMAP_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        // reserved u8 + u16
        cur.skip(3)?;

        let num_functions = cur.read_u32()?;
        let num_constants = cur.read_u32()?;
        let num_records = cur.read_u32()?;

        let functions_offset = cur.pos;
        cur.skip_array(num_functions as usize, FUNCTION_SIZE)?;
        let constants_offset = cur.pos;
        cur.skip_array(num_constants as usize, CONSTANT_SIZE)?;
        let callsites_offset = cur.pos;

        let reader = StackMapReader {
            data,
            header: Header {
                version,
                num_functions,
                num_constants,
                num_records,
            },
            functions_offset,
            constants_offset,
            callsites_offset,
            _phantom: PhantomData,
        };

        let functions_sum = reader
            .functions()
            .fold(0u64, |sum, f| sum.saturating_add(f.callsite_count));
        if functions_sum != u64::from(num_records) {
            return Err(ParseError::BadRecordCount {
                actual: num_records.into(),
                functions_sum,
            });
        }

        Ok(reader)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn function(&self, index: usize) -> Option<FunctionInfo> {
        if index >= self.header.num_functions as usize {
            return None;
        }
        let start = self.functions_offset + index * FUNCTION_SIZE;
        let bytes = self.data.get(start..start + FUNCTION_SIZE)?;
        Some(FunctionInfo {
            address: BO::read_u64(&bytes[0..8]),
            stack_size: BO::read_u64(&bytes[8..16]),
            callsite_count: BO::read_u64(&bytes[16..24]),
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = FunctionInfo> + '_ {
        (0..self.header.num_functions as usize).filter_map(move |i| self.function(i))
    }

    /// The constant pool, as raw words. Nothing here interprets them.
    pub fn constants(&self) -> impl Iterator<Item = u64> + 'a {
        let len = self.header.num_constants as usize * CONSTANT_SIZE;
        self.data[self.constants_offset..self.constants_offset + len]
            .chunks_exact(CONSTANT_SIZE)
            .map(BO::read_u64)
    }

    /// Offset of the first callsite record, right after the constant pool.
    pub fn callsites_offset(&self) -> usize {
        self.callsites_offset
    }

    pub fn callsite_at(&self, offset: usize) -> Result<Callsite<'a, BO>> {
        Callsite::parse(self.data, offset)
    }

    /// Walks exactly `num_records` callsite records in section order.
    pub fn callsites(&self) -> Callsites<'a, BO> {
        Callsites {
            data: self.data,
            offset: self.callsites_offset,
            remaining: self.header.num_records,
            _phantom: PhantomData,
        }
    }
}

/// A single callsite record inside the section.
pub struct Callsite<'a, BO: ByteOrder> {
    data: &'a [u8],
    offset: usize,
    patch_point_id: u64,
    code_offset: u32,
    flags: u16,
    locations: &'a [u8],
    _phantom: PhantomData<BO>,
}

impl<'a, BO: ByteOrder> Clone for Callsite<'a, BO> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, BO: ByteOrder> Copy for Callsite<'a, BO> {}

impl<'a, BO: ByteOrder + 'a> fmt::Debug for Callsite<'a, BO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callsite")
            .field("offset", &self.offset)
            .field("patch_point_id", &self.patch_point_id)
            .field("code_offset", &self.code_offset)
            .field("num_locations", &self.num_locations())
            .finish()
    }
}

impl<'a, BO: ByteOrder + 'a> Callsite<'a, BO> {
    fn parse(data: &'a [u8], offset: usize) -> Result<Self> {
        let mut cur = Cursor::<BO>::at(data, offset);
        let patch_point_id = cur.read_u64()?;
        let code_offset = cur.read_u32()?;
        let flags = cur.read_u16()?;
        let num_locations = cur.read_u16()?;

        let len = num_locations as usize * LOCATION_SIZE;
        let locations = cur.read_n(len)?;

        Ok(Callsite {
            data,
            offset,
            patch_point_id,
            code_offset,
            flags,
            locations,
            _phantom: PhantomData,
        })
    }

    /// Byte offset of this record from the start of the section.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn patch_point_id(&self) -> u64 {
        self.patch_point_id
    }

    /// Instruction offset from the owning function's address.
    pub fn code_offset(&self) -> u32 {
        self.code_offset
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn num_locations(&self) -> usize {
        self.locations.len() / LOCATION_SIZE
    }

    pub fn location(&self, index: usize) -> Option<RawLocation> {
        let start = index.checked_mul(LOCATION_SIZE)?;
        self.locations
            .get(start..start + LOCATION_SIZE)
            .map(decode_location::<BO>)
    }

    pub fn locations(&self) -> impl ExactSizeIterator<Item = RawLocation> + Clone + 'a {
        self.locations
            .chunks_exact(LOCATION_SIZE)
            .map(decode_location::<BO>)
    }

    /// Liveout registers recorded after the locations.
    pub fn live_outs(&self) -> Result<Vec<LiveOut>> {
        let mut cur = self.live_out_cursor()?;
        let num_live_outs = cur.read_u16()?;
        let mut live_outs = Vec::with_capacity(num_live_outs as usize);
        for _ in 0..num_live_outs {
            let reg = cur.read_u16()?;
            cur.skip(1)?;
            let size = cur.read_u8()?;
            live_outs.push(LiveOut { reg, size });
        }
        Ok(live_outs)
    }

    /// Offset of the record following this one.
    pub fn advance(&self) -> Result<usize> {
        let mut cur = self.live_out_cursor()?;
        let num_live_outs = cur.read_u16()?;
        cur.skip_array(num_live_outs as usize, LIVEOUT_SIZE)?;
        cur.realign()?;
        Ok(cur.pos)
    }

    // positioned at the liveout count, past the realignment and the u16 padding
    fn live_out_cursor(&self) -> Result<Cursor<'a, BO>> {
        let end_of_locations = self.offset + CALLSITE_HEADER_SIZE + self.locations.len();
        let mut cur = Cursor::at(self.data, end_of_locations);
        cur.realign()?;
        // the header ends with the u16 count
        cur.skip(LIVEOUT_HEADER_SIZE - 2)?;
        Ok(cur)
    }
}

fn decode_location<BO: ByteOrder>(bytes: &[u8]) -> RawLocation {
    RawLocation {
        kind: bytes[0],
        size: BO::read_u16(&bytes[2..4]),
        reg: BO::read_u16(&bytes[4..6]),
        offset: BO::read_i32(&bytes[8..12]),
    }
}

/// Iterator over the callsite records of a section, see [`StackMapReader::callsites`].
///
/// Stops after the first error.
pub struct Callsites<'a, BO: ByteOrder> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
    _phantom: PhantomData<BO>,
}

impl<'a, BO: ByteOrder + 'a> Iterator for Callsites<'a, BO> {
    type Item = Result<Callsite<'a, BO>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let step = Callsite::parse(self.data, self.offset)
            .and_then(|callsite| Ok((callsite, callsite.advance()?)));
        match step {
            Ok((callsite, next)) => {
                self.offset = next;
                Some(Ok(callsite))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
