use crate::config::TableConfig;
use crate::error::Result;
use crate::frame::{FrameDescriptor, FrameRef};
use log::{debug, trace};

/// Frames whose return addresses hash to the same bucket, packed back to back.
#[derive(Default)]
struct Bucket {
    num_entries: usize,
    entries: Vec<u8>,
}

impl Bucket {
    fn frames(&self) -> Frames<'_> {
        Frames {
            rest: &self.entries,
            remaining: self.num_entries,
        }
    }
}

struct Frames<'a> {
    rest: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for Frames<'a> {
    type Item = FrameRef<'a>;

    fn next(&mut self) -> Option<FrameRef<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let (frame, rest) = FrameRef::split(self.rest)?;
        self.rest = rest;
        self.remaining -= 1;
        Some(frame)
    }
}

/// Maps return addresses to the frame descriptors of their safepoints.
///
/// The bucket count is fixed when the table is created and never changes.
/// Each bucket keeps its frames in one contiguous allocation that grows as
/// frames are appended, so a lookup touches a single buffer.
pub struct StatepointTable {
    buckets: Vec<Bucket>,
    len: usize,
}

/// One round of xorshift64*.
fn hash(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(2685821657736338717)
}

impl StatepointTable {
    pub fn new(load_factor: f32, expected: usize) -> Result<Self> {
        Self::with_config(&TableConfig::new(load_factor), expected)
    }

    pub fn with_config(config: &TableConfig, expected: usize) -> Result<Self> {
        let num_buckets = config.bucket_count(expected)?;

        let mut buckets = Vec::new();
        buckets.try_reserve_exact(num_buckets)?;
        buckets.resize_with(num_buckets, Bucket::default);

        debug!(
            "statepoint table: {} buckets for {} frames at load factor {}",
            num_buckets, expected, config.load_factor
        );
        Ok(StatepointTable { buckets, len: 0 })
    }

    // the modulo is slightly biased towards low buckets, which is fine here
    fn bucket_index(&self, return_address: u64) -> usize {
        (hash(return_address) % self.buckets.len() as u64) as usize
    }

    /// Adds `frame` under its return address.
    ///
    /// Frames already in the bucket keep their position; the new one goes
    /// after them. On allocation failure the table is left unchanged.
    pub fn insert(&mut self, frame: FrameDescriptor) -> Result<()> {
        let index = self.bucket_index(frame.return_address);
        let bucket = &mut self.buckets[index];

        bucket
            .entries
            .try_reserve_exact(FrameDescriptor::encoded_size(frame.slots.len()))?;
        frame.encode_into(&mut bucket.entries);
        bucket.num_entries += 1;
        self.len += 1;

        trace!("bucket {}: {}", index, frame);
        Ok(())
    }

    /// Finds the frame recorded for `return_address`. When the same address
    /// was inserted more than once, the first insertion wins.
    pub fn lookup(&self, return_address: u64) -> Option<FrameRef<'_>> {
        self.buckets[self.bucket_index(return_address)]
            .frames()
            .find(|frame| frame.return_address() == return_address)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of frames in bucket `index`.
    pub fn bucket_len(&self, index: usize) -> Option<usize> {
        self.buckets.get(index).map(|bucket| bucket.num_entries)
    }

    /// Bytes of packed frames held by bucket `index`.
    pub fn bucket_bytes(&self, index: usize) -> Option<usize> {
        self.buckets.get(index).map(|bucket| bucket.entries.len())
    }

    pub fn max_bucket_len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.num_entries)
            .max()
            .unwrap_or(0)
    }

    /// Every frame, bucket by bucket.
    pub fn frames(&self) -> impl Iterator<Item = FrameRef<'_>> {
        self.buckets.iter().flat_map(Bucket::frames)
    }
}
