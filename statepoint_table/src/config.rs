use crate::error::{BuildError, Result};

pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Sizing knobs for [`StatepointTable`](crate::StatepointTable).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableConfig {
    /// Expected frames per bucket. Values above 1 trade lookup scans for a
    /// smaller bucket array.
    pub load_factor: f32,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            load_factor: DEFAULT_LOAD_FACTOR,
        }
    }
}

impl TableConfig {
    pub fn new(load_factor: f32) -> Self {
        TableConfig { load_factor }
    }

    pub fn validate(&self, expected: usize) -> Result<()> {
        if !self.load_factor.is_finite() || self.load_factor <= 0.0 || expected == 0 {
            return Err(BuildError::InvalidTableSize {
                load_factor: self.load_factor,
                expected,
            });
        }
        Ok(())
    }

    /// `floor(expected / load_factor) + 1`, saturating at `usize::MAX`.
    ///
    /// The division stays in `f32`: widening the load factor first would
    /// expose its rounding error, so 10 frames at 0.1 would get 100 buckets
    /// instead of 101.
    pub fn bucket_count(&self, expected: usize) -> Result<usize> {
        self.validate(expected)?;
        let buckets = (expected as f32 / self.load_factor).floor() as usize;
        Ok(buckets.saturating_add(1))
    }
}
