use crate::scheduler::error::{SchedulerError, SchedulerResult};

/// One contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Partition of a file into `ceil(file_size / chunk_size)` ordered,
/// non-overlapping ranges. Part numbers start at 1.
///
/// A zero-byte file still yields one empty part, since the backend requires
/// at least one part to complete a multipart transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    file_size: u64,
    chunk_size: u64,
    parts: Vec<PartRange>,
}

impl PartPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> SchedulerResult<Self> {
        if chunk_size == 0 {
            return Err(SchedulerError::Configuration(
                "chunk size must be positive".into(),
            ));
        }

        let count = file_size.div_ceil(chunk_size).max(1);
        let count = u32::try_from(count).map_err(|_| {
            SchedulerError::Configuration(format!(
                "{file_size} bytes at {chunk_size} bytes per part needs too many parts"
            ))
        })?;

        let parts = (0..count)
            .map(|index| {
                let offset = index as u64 * chunk_size;
                PartRange {
                    part_number: index + 1,
                    offset,
                    len: chunk_size.min(file_size.saturating_sub(offset)),
                }
            })
            .collect();

        Ok(Self {
            file_size,
            chunk_size,
            parts,
        })
    }

    pub fn parts(&self) -> &[PartRange] {
        &self.parts
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn get(&self, part_number: u32) -> Option<&PartRange> {
        part_number
            .checked_sub(1)
            .and_then(|index| self.parts.get(index as usize))
    }
}
