use anyhow::Error;

use super::representation::{AccessRecord, OpKind};

/// Number of records a [`LogBuffer`] holds before it is flushed.
pub const LOG_CAPACITY: usize = 1_000_000;

/// A fixed-capacity, insertion-ordered store of access records.
///
/// The buffer is allocated once. Whenever an append fills it up, the
/// records are handed to a drain closure and the buffer starts over at
/// offset 0 before the append returns, so the number of stored records
/// never exceeds the capacity.
pub struct LogBuffer {
    records: Vec<AccessRecord>,
    capacity: usize,
}

impl LogBuffer {
    /// Creates an empty buffer holding [`LOG_CAPACITY`] records.
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    /// Creates an empty buffer holding `capacity` records.
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The current write offset.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The buffered records in insertion order.
    pub fn records(&self) -> &[AccessRecord] {
        &self.records
    }

    /// Appends a new record and drains the buffer if it became full.
    ///
    /// A buffer left full by a failed drain is drained again before the
    /// record is stored, so the offset never exceeds the capacity.
    ///
    /// Returns `true` if the append triggered a flush.
    ///
    /// # Errors
    ///
    /// Fails if `drain` fails. The records stay buffered in that case. If
    /// the retried drain of a full buffer fails, the new record is not
    /// stored.
    pub fn append<F>(
        &mut self,
        address: u64,
        size: u32,
        op: OpKind,
        mut drain: F,
    ) -> Result<bool, Error>
    where
        F: FnMut(&[AccessRecord]) -> Result<(), Error>,
    {
        let mut flushed = false;
        if self.records.len() >= self.capacity {
            self.drain_full(&mut drain)?;
            flushed = true;
        }

        self.records.push(AccessRecord::new(address, size, op));

        if self.records.len() >= self.capacity {
            self.drain_full(&mut drain)?;
            flushed = true;
        }

        Ok(flushed)
    }

    fn drain_full<F>(&mut self, drain: &mut F) -> Result<(), Error>
    where
        F: FnMut(&[AccessRecord]) -> Result<(), Error>,
    {
        log::info!(
            "Log buffer reached its capacity of {} records, flushing ...",
            self.capacity
        );
        drain(&self.records)?;
        self.records.clear();
        Ok(())
    }

    /// Hands all buffered records to `drain` without clearing the buffer.
    ///
    /// # Errors
    ///
    /// Fails if `drain` fails.
    pub fn flush<F>(&self, drain: F) -> Result<(), Error>
    where
        F: FnOnce(&[AccessRecord]) -> Result<(), Error>,
    {
        drain(&self.records)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
