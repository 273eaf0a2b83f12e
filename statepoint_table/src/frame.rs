use crate::error::{BuildError, Result, Violation};
use byteorder::{ByteOrder, NativeEndian};
use llvm_stackmaps::{
    Callsite, FunctionInfo, LocationKind, RawLocation, CALLSITE_HEADER_SIZE, LOCATION_SIZE,
};
use std::fmt;

/// Packed slot kind marking a base pointer. Any other value is the index of the base slot.
const BASE_SENTINEL: i32 = -1;

/// return address, frame size, slot count, padding
pub(crate) const FRAME_HEADER_SIZE: usize = 24;
/// kind, frame offset
pub(crate) const SLOT_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Base,
    /// Relocated along with the base slot at `base_index` in the same frame.
    Derived { base_index: u16 },
}

/// A stack slot holding a live gc pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerSlot {
    pub kind: SlotKind,
    /// Byte offset of the slot, relative to the frame.
    pub offset: i32,
}

impl PointerSlot {
    pub fn base(offset: i32) -> Self {
        PointerSlot {
            kind: SlotKind::Base,
            offset,
        }
    }

    pub fn derived(base_index: u16, offset: i32) -> Self {
        PointerSlot {
            kind: SlotKind::Derived { base_index },
            offset,
        }
    }

    pub fn is_base(&self) -> bool {
        self.kind == SlotKind::Base
    }

    pub fn base_index(&self) -> Option<usize> {
        match self.kind {
            SlotKind::Base => None,
            SlotKind::Derived { base_index } => Some(base_index.into()),
        }
    }

    pub fn frame_offset(&self) -> i32 {
        self.offset
    }

    fn encode(&self, out: &mut [u8]) {
        let kind = match self.kind {
            SlotKind::Base => BASE_SENTINEL,
            SlotKind::Derived { base_index } => base_index.into(),
        };
        NativeEndian::write_i32(&mut out[0..4], kind);
        NativeEndian::write_i32(&mut out[4..8], self.offset);
    }

    fn decode(bytes: &[u8]) -> Self {
        let kind = NativeEndian::read_i32(&bytes[0..4]);
        let offset = NativeEndian::read_i32(&bytes[4..8]);
        match u16::try_from(kind) {
            Ok(base_index) => PointerSlot::derived(base_index, offset),
            Err(_) => PointerSlot::base(offset),
        }
    }
}

/// Everything the collector needs to know about the frame of one safepoint.
///
/// `slots` holds every base pointer first, then every derived pointer, each
/// group in the order the compiler listed them. A derived slot's
/// `base_index` always points into the base prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub return_address: u64,
    pub frame_size: u64,
    pub slots: Vec<PointerSlot>,
}

impl FrameDescriptor {
    /// Bytes taken by a packed frame with `num_slots` slots.
    pub const fn encoded_size(num_slots: usize) -> usize {
        FRAME_HEADER_SIZE + num_slots * SLOT_SIZE
    }

    /// Reads the gc pointer pairs of a statepoint record.
    ///
    /// A statepoint's locations are three constants (calling convention,
    /// flags, deopt count `n`), `n` deopt values, then (base, derived) pairs
    /// which must all be spilled to the stack. A pair whose two locations
    /// coincide is a base pointer.
    pub fn from_callsite<'a, BO: ByteOrder + 'a>(
        callsite: &Callsite<'a, BO>,
        function: &FunctionInfo,
    ) -> Result<Self> {
        let violation = |violation: Violation| BuildError::FormatViolation {
            offset: callsite.offset(),
            violation,
        };
        let location_offset =
            |index: usize| callsite.offset() + CALLSITE_HEADER_SIZE + index * LOCATION_SIZE;

        let return_address = function
            .address
            .checked_add(callsite.code_offset().into())
            .ok_or_else(|| violation(Violation::ReturnAddressOverflow))?;

        let num_locations = callsite.num_locations();
        if num_locations < 3 {
            return Err(violation(Violation::TooFewLocations(num_locations)));
        }

        let mut locations = callsite.locations();
        for (index, location) in locations.by_ref().take(2).enumerate() {
            if !location.is(LocationKind::Constant) {
                return Err(violation(Violation::LeadingNotConstant { index }));
            }
        }
        let num_deopt = match locations.next() {
            Some(location) if location.is(LocationKind::Constant) => location.offset,
            _ => return Err(violation(Violation::DeoptCountNotConstant)),
        };
        let num_deopt = usize::try_from(num_deopt)
            .map_err(|_| violation(Violation::NegativeDeoptCount(num_deopt)))?;

        let remaining = locations.len();
        if num_deopt > remaining {
            return Err(violation(Violation::DeoptCountOverflow {
                deopt: num_deopt,
                remaining,
            }));
        }
        let remaining = remaining - num_deopt;
        if remaining % 2 != 0 {
            return Err(violation(Violation::UnpairedLocations(remaining)));
        }
        let first_pair = 3 + num_deopt;
        let gc_locations = locations.skip(num_deopt);

        let mut slots = Vec::new();
        slots.try_reserve_exact(remaining / 2)?;

        for (i, (base, derived)) in pairs(gc_locations.clone()).enumerate() {
            for (k, location) in [base, derived].iter().enumerate() {
                // unknown kind bytes are rejected the same way as registers
                if location.kind().ok() != Some(LocationKind::Indirect) {
                    return Err(BuildError::UnsupportedLocationKind {
                        offset: location_offset(first_pair + 2 * i + k),
                        kind: location.kind,
                    });
                }
            }
            if is_base_pointer(&base, &derived) {
                slots.push(PointerSlot::base(base.offset));
            }
        }

        let num_bases = slots.len();
        for (base, derived) in pairs(gc_locations) {
            if is_base_pointer(&base, &derived) {
                continue;
            }
            let base_index = slots[..num_bases]
                .iter()
                .position(|slot| slot.offset == base.offset)
                .ok_or(BuildError::MissingBasePointer {
                    return_address,
                    base_offset: base.offset,
                })?;
            // at most u16::MAX / 2 pairs per record
            slots.push(PointerSlot::derived(base_index as u16, derived.offset));
        }

        Ok(FrameDescriptor {
            return_address,
            frame_size: function.stack_size,
            slots,
        })
    }

    pub fn num_base_pointers(&self) -> usize {
        self.slots.iter().take_while(|slot| slot.is_base()).count()
    }

    /// Appends the packed form to `buf`.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + Self::encoded_size(self.slots.len()), 0);
        let out = &mut buf[start..];

        NativeEndian::write_u64(&mut out[0..8], self.return_address);
        NativeEndian::write_u64(&mut out[8..16], self.frame_size);
        NativeEndian::write_u32(&mut out[16..20], self.slots.len() as u32);

        let slot_bytes = out[FRAME_HEADER_SIZE..].chunks_exact_mut(SLOT_SIZE);
        for (slot, chunk) in self.slots.iter().zip(slot_bytes) {
            slot.encode(chunk);
        }
    }
}

fn is_base_pointer(base: &RawLocation, derived: &RawLocation) -> bool {
    base.kind == derived.kind && base.offset == derived.offset
}

fn pairs<I>(mut locations: I) -> impl Iterator<Item = (RawLocation, RawLocation)>
where
    I: Iterator<Item = RawLocation>,
{
    std::iter::from_fn(move || Some((locations.next()?, locations.next()?)))
}

/// A packed frame inside a table bucket.
#[derive(Clone, Copy)]
pub struct FrameRef<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameRef<'a> {
    /// Splits the first packed frame off `bytes`, returning it and the bytes after it.
    pub(crate) fn split(bytes: &'a [u8]) -> Option<(FrameRef<'a>, &'a [u8])> {
        let header = bytes.get(..FRAME_HEADER_SIZE)?;
        let num_slots = NativeEndian::read_u32(&header[16..20]) as usize;
        let size = FrameDescriptor::encoded_size(num_slots);
        if bytes.len() < size {
            return None;
        }
        let (frame, rest) = bytes.split_at(size);
        Some((FrameRef { bytes: frame }, rest))
    }

    pub fn return_address(&self) -> u64 {
        NativeEndian::read_u64(&self.bytes[0..8])
    }

    pub fn frame_size(&self) -> u64 {
        NativeEndian::read_u64(&self.bytes[8..16])
    }

    pub fn num_slots(&self) -> usize {
        (self.bytes.len() - FRAME_HEADER_SIZE) / SLOT_SIZE
    }

    pub fn encoded_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn slot(&self, index: usize) -> Option<PointerSlot> {
        let start = FRAME_HEADER_SIZE + index.checked_mul(SLOT_SIZE)?;
        self.bytes
            .get(start..start + SLOT_SIZE)
            .map(PointerSlot::decode)
    }

    pub fn slots(&self) -> impl ExactSizeIterator<Item = PointerSlot> + 'a {
        self.bytes[FRAME_HEADER_SIZE..]
            .chunks_exact(SLOT_SIZE)
            .map(PointerSlot::decode)
    }

    pub fn num_base_pointers(&self) -> usize {
        self.slots().take_while(|slot| slot.is_base()).count()
    }

    pub fn to_descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            return_address: self.return_address(),
            frame_size: self.frame_size(),
            slots: self.slots().collect(),
        }
    }
}

impl fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("return_address", &self.return_address())
            .field("frame_size", &self.frame_size())
            .field("slots", &self.slots().collect::<Vec<_>>())
            .finish()
    }
}

impl PartialEq<FrameDescriptor> for FrameRef<'_> {
    fn eq(&self, other: &FrameDescriptor) -> bool {
        self.return_address() == other.return_address
            && self.frame_size() == other.frame_size
            && self.slots().eq(other.slots.iter().copied())
    }
}

fn fmt_frame(
    f: &mut fmt::Formatter<'_>,
    return_address: u64,
    frame_size: u64,
    slots: impl ExactSizeIterator<Item = PointerSlot>,
) -> fmt::Result {
    write!(
        f,
        "return address {:#x}, frame size {}, {} live ptrs",
        return_address,
        frame_size,
        slots.len()
    )?;
    for (i, slot) in slots.enumerate() {
        match slot.kind {
            SlotKind::Base => write!(f, "\n  #{}: base ptr", i)?,
            SlotKind::Derived { base_index } => {
                write!(f, "\n  #{}: ptr derived from #{}", i, base_index)?
            }
        }
        write!(f, " at frame offset {}", slot.offset)?;
    }
    Ok(())
}

impl fmt::Display for FrameRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(f, self.return_address(), self.frame_size(), self.slots())
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(
            f,
            self.return_address,
            self.frame_size,
            self.slots.iter().copied(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llvm_stackmaps::{StackMapBuilder, StackMapReader};
    use proptest::prelude::*;

    fn c(value: i32) -> RawLocation {
        RawLocation::constant(value)
    }

    fn ind(offset: i32) -> RawLocation {
        RawLocation::indirect(7, offset)
    }

    fn frame_of(locations: &[RawLocation]) -> Result<FrameDescriptor> {
        let data = StackMapBuilder::<NativeEndian>::new()
            .function(0x1000, 32, 1)
            .callsite(0x10, locations, &[])
            .finish();
        let reader = StackMapReader::<NativeEndian>::new(&data).unwrap();
        let function = reader.function(0).unwrap();
        let callsite = reader.callsites().next().unwrap().unwrap();
        FrameDescriptor::from_callsite(&callsite, &function)
    }

    fn violation_of(locations: &[RawLocation]) -> Violation {
        match frame_of(locations) {
            Err(BuildError::FormatViolation { violation, .. }) => violation,
            other => panic!("expected a format violation, got {:?}", other),
        }
    }

    #[test]
    fn base_and_derived() {
        let frame = frame_of(&[c(0), c(0), c(0), ind(-8), ind(-8), ind(-8), ind(-16)]).unwrap();
        assert_eq!(
            frame,
            FrameDescriptor {
                return_address: 0x1010,
                frame_size: 32,
                slots: vec![PointerSlot::base(-8), PointerSlot::derived(0, -16)],
            }
        );
        assert_eq!(frame.num_base_pointers(), 1);
        assert!(frame.slots[0].is_base());
        assert_eq!(frame.slots[1].base_index(), Some(0));
        assert_eq!(frame.slots[1].frame_offset(), -16);
    }

    #[test]
    fn bases_come_first() {
        let frame = frame_of(&[
            c(0),
            c(0),
            c(0),
            ind(-8),
            ind(-40),
            ind(-16),
            ind(-16),
            ind(-16),
            ind(-48),
            ind(-8),
            ind(-8),
        ])
        .unwrap();
        assert_eq!(
            frame.slots,
            vec![
                PointerSlot::base(-16),
                PointerSlot::base(-8),
                PointerSlot::derived(1, -40),
                PointerSlot::derived(0, -48),
            ]
        );
    }

    #[test]
    fn no_gc_pointers() {
        let frame = frame_of(&[c(0), c(0), c(0)]).unwrap();
        assert!(frame.slots.is_empty());
    }

    #[test]
    fn deopt_values_are_skipped() {
        // deopt values are never decoded, so even unknown kinds are fine
        let unknown = RawLocation {
            kind: 0x7f,
            size: 8,
            reg: 0,
            offset: 0,
        };
        let frame = frame_of(&[
            c(0),
            c(0),
            c(3),
            RawLocation::register(3),
            unknown,
            RawLocation::constant_index(0),
            ind(-24),
            ind(-24),
        ])
        .unwrap();
        assert_eq!(frame.slots, vec![PointerSlot::base(-24)]);
    }

    #[test]
    fn leading_constants() {
        assert_eq!(
            violation_of(&[ind(0), c(0), c(0)]),
            Violation::LeadingNotConstant { index: 0 }
        );
        assert_eq!(
            violation_of(&[c(0), RawLocation::register(1), c(0)]),
            Violation::LeadingNotConstant { index: 1 }
        );
        assert_eq!(
            violation_of(&[c(0), c(0), ind(-8), ind(-8)]),
            Violation::DeoptCountNotConstant
        );
        assert_eq!(violation_of(&[c(0), c(0)]), Violation::TooFewLocations(2));
    }

    #[test]
    fn bad_deopt_counts() {
        assert_eq!(
            violation_of(&[c(0), c(0), c(-1), ind(-8), ind(-8)]),
            Violation::NegativeDeoptCount(-1)
        );
        assert_eq!(
            violation_of(&[c(0), c(0), c(3), ind(-8), ind(-8)]),
            Violation::DeoptCountOverflow {
                deopt: 3,
                remaining: 2,
            }
        );
    }

    #[test]
    fn unpaired_locations() {
        assert_eq!(
            violation_of(&[c(0), c(0), c(0), ind(-8), ind(-8), ind(-8)]),
            Violation::UnpairedLocations(3)
        );
        // odd only once the deopt value is skipped
        assert_eq!(
            violation_of(&[c(0), c(0), c(1), ind(0), ind(-8)]),
            Violation::UnpairedLocations(1)
        );
    }

    #[test]
    fn pointers_must_be_spilled() {
        let err = frame_of(&[c(0), c(0), c(0), ind(-8), RawLocation::register(3)]).unwrap_err();
        match err {
            BuildError::UnsupportedLocationKind { offset, kind } => {
                assert_eq!(kind, LocationKind::Register as u8);
                // header, function, then the fifth location of the record
                assert_eq!(offset, 16 + 24 + CALLSITE_HEADER_SIZE + 4 * LOCATION_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }

        for location in [RawLocation::direct(6, -8), c(5), RawLocation::constant_index(0)] {
            assert!(matches!(
                frame_of(&[c(0), c(0), c(0), location, ind(-8)]),
                Err(BuildError::UnsupportedLocationKind { .. })
            ));
        }
    }

    #[test]
    fn unknown_pointer_location_kind() {
        let unknown = RawLocation {
            kind: 0x7f,
            size: 8,
            reg: 7,
            offset: -8,
        };
        assert!(matches!(
            frame_of(&[c(0), c(0), c(0), unknown, unknown]),
            Err(BuildError::UnsupportedLocationKind { kind: 0x7f, .. })
        ));
    }

    #[test]
    fn derived_needs_tracked_base() {
        let err = frame_of(&[c(0), c(0), c(0), ind(-8), ind(-8), ind(-24), ind(-32)]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingBasePointer {
                return_address: 0x1010,
                base_offset: -24,
            }
        ));
    }

    #[test]
    fn return_address_overflow() {
        let data = StackMapBuilder::<NativeEndian>::new()
            .function(u64::MAX, 32, 1)
            .callsite(0x10, &[c(0), c(0), c(0)], &[])
            .finish();
        let reader = StackMapReader::<NativeEndian>::new(&data).unwrap();
        let callsite = reader.callsites().next().unwrap().unwrap();
        assert!(matches!(
            FrameDescriptor::from_callsite(&callsite, &reader.function(0).unwrap()),
            Err(BuildError::FormatViolation {
                violation: Violation::ReturnAddressOverflow,
                ..
            })
        ));
    }

    #[test]
    fn packed_form() {
        let frame = FrameDescriptor {
            return_address: 0x4000_0010,
            frame_size: 64,
            slots: vec![
                PointerSlot::base(-8),
                PointerSlot::base(-16),
                PointerSlot::derived(1, -24),
            ],
        };
        let mut buf = vec![0xaa; 3];
        frame.encode_into(&mut buf);
        assert_eq!(buf.len(), 3 + FrameDescriptor::encoded_size(3));
        assert_eq!(FrameDescriptor::encoded_size(3), 48);

        let (packed, rest) = FrameRef::split(&buf[3..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(packed, frame);
        assert_eq!(packed.num_slots(), 3);
        assert_eq!(packed.num_base_pointers(), 2);
        assert_eq!(packed.slot(2), Some(PointerSlot::derived(1, -24)));
        assert_eq!(packed.slot(3), None);
        assert_eq!(packed.to_descriptor(), frame);

        assert!(FrameRef::split(&buf[3..buf.len() - 1]).is_none());
    }

    #[test]
    fn display() {
        let frame = FrameDescriptor {
            return_address: 0x1010,
            frame_size: 32,
            slots: vec![PointerSlot::base(-8), PointerSlot::derived(0, -16)],
        };
        assert_eq!(
            frame.to_string(),
            "return address 0x1010, frame size 32, 2 live ptrs\n  \
             #0: base ptr at frame offset -8\n  \
             #1: ptr derived from #0 at frame offset -16"
        );
    }

    proptest! {
        #[test]
        fn odd_pair_counts_are_rejected(num_pairs in 0usize..20, deopt in 0usize..5) {
            let mut locations = vec![c(0), c(0), c(deopt as i32)];
            locations.extend((0..deopt).map(|i| c(i as i32)));
            locations.extend((0..2 * num_pairs + 1).map(|i| ind(-8 * i as i32)));
            prop_assert_eq!(
                violation_of(&locations),
                Violation::UnpairedLocations(2 * num_pairs + 1)
            );
        }

        #[test]
        fn bases_form_a_prefix(pattern in proptest::collection::vec(any::<bool>(), 1..24)) {
            // every base at its own offset, every derived pair refers to the first base
            let mut locations = vec![c(0), c(0), c(0), ind(0), ind(0)];
            let mut expected_bases = 1;
            for (i, &is_base) in pattern.iter().enumerate() {
                let offset = -8 * (i as i32 + 1);
                if is_base {
                    expected_bases += 1;
                    locations.extend([ind(offset), ind(offset)]);
                } else {
                    locations.extend([ind(0), ind(offset)]);
                }
            }

            let frame = frame_of(&locations).unwrap();
            prop_assert_eq!(frame.slots.len(), pattern.len() + 1);
            prop_assert_eq!(frame.num_base_pointers(), expected_bases);
            for slot in &frame.slots[expected_bases..] {
                prop_assert_eq!(slot.base_index(), Some(0));
            }
        }
    }
}
