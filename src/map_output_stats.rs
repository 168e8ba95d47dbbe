//! `MapOutputStatistics` (spec.md §3): per-reducer byte and row counts
//! emitted by a completed shuffle write, grounded in the `PartitionStats`
//! shape the teacher's `write_stream_to_disk` (`shuffle/writer.rs`) already
//! returns: plain loop counters for `num_rows`/`num_batches`/`num_bytes`
//! accumulated per partition while streaming batches to disk.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutputStatistics {
    pub bytes_by_partition_id: Vec<u64>,
    pub rows_by_partition_id: Vec<u64>,
    pub num_mappers: u32,
}

impl MapOutputStatistics {
    pub fn new(bytes_by_partition_id: Vec<u64>, rows_by_partition_id: Vec<u64>, num_mappers: u32) -> Self {
        assert_eq!(
            bytes_by_partition_id.len(),
            rows_by_partition_id.len(),
            "bytes and rows vectors must describe the same partition count"
        );
        Self {
            bytes_by_partition_id,
            rows_by_partition_id,
            num_mappers,
        }
    }

    /// `P`, the pre-shuffle partition count.
    pub fn num_partitions(&self) -> usize {
        self.bytes_by_partition_id.len()
    }
}
