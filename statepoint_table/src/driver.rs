use crate::config::TableConfig;
use crate::error::Result;
use crate::frame::FrameDescriptor;
use crate::table::StatepointTable;
use llvm_stackmaps::{ByteOrder, NativeEndian, StackMapReader};
use log::debug;
use std::iter;

/// Builds the table for a stackmap section emitted for the running target.
pub fn build_table(section: &[u8], load_factor: f32) -> Result<StatepointTable> {
    build_table_with::<NativeEndian>(section, &TableConfig::new(load_factor))
}

/// Builds the table for a stackmap section in byte order `BO`.
///
/// Any malformed record fails the whole build.
pub fn build_table_with<BO: ByteOrder + 'static>(
    section: &[u8],
    config: &TableConfig,
) -> Result<StatepointTable> {
    let reader = StackMapReader::<BO>::new(section)?;
    let header = *reader.header();
    let mut table = StatepointTable::with_config(config, (header.num_records as usize).max(1))?;

    // records don't say which function they belong to, they follow the
    // functions' callsite counts in order. The reader has already checked
    // that those counts add up to the number of records.
    let owners = reader
        .functions()
        .flat_map(|function| iter::repeat(function).take(function.callsite_count as usize));

    for (owner, callsite) in owners.zip(reader.callsites()) {
        let callsite = callsite?;
        table.insert(FrameDescriptor::from_callsite(&callsite, &owner)?)?;
    }

    debug!(
        "built statepoint table from {} functions: {} frames in {} buckets, longest bucket {}",
        header.num_functions,
        table.len(),
        table.bucket_count(),
        table.max_bucket_len()
    );
    Ok(table)
}
