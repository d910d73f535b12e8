use std::io::Write;

use anyhow::Error;

use crate::tracing::AccessRecord;

/// An encoder emitting access records as chunk-aligned text lines.
///
/// Each record expands to one line per 8-byte chunk it touches:
///
/// ```text
/// 0x1000 READ    0
/// 0x1008 READ    0
/// ```
///
/// The address is uppercase hex without leading zeros, the kind label is
/// padded to 7 characters and the cycle is printed in decimal.
pub struct LineFormatEncoder;

impl LineFormatEncoder {
    pub fn new() -> Self {
        Self {}
    }

    fn encode_record<W: Write>(&self, record: &AccessRecord, output: &mut W) -> Result<u64, Error> {
        let mut lines = 0;
        for chunk in record.chunks() {
            writeln!(
                output,
                "0x{chunk:X} {} {}",
                record.op().label(),
                record.cycle()
            )?;
            lines += 1;
        }

        Ok(lines)
    }

    /// Writes all records of `input` in order and returns the number of lines written.
    pub fn encode<'a, W: Write, I: IntoIterator<Item = &'a AccessRecord>>(
        &mut self,
        input: I,
        mut output: W,
    ) -> Result<u64, Error> {
        let mut lines = 0;
        for record in input {
            lines += self.encode_record(record, &mut output)?;
        }

        Ok(lines)
    }
}

impl Default for LineFormatEncoder {
    fn default() -> Self {
        Self::new()
    }
}
