use std::{
    fs::File,
    io::{self, BufWriter, Stderr, Write},
    path::Path,
};

use anyhow::{Context, Error, anyhow};
use gctracer_error::{Fault, errno};

use crate::{line_format::LineFormatEncoder, tracing::AccessRecord};

/// The output a tracer writes its log to.
pub enum Destination {
    /// A file created (or truncated) at startup
    File(BufWriter<File>),

    /// The diagnostic stream of the process
    Diagnostic(BufWriter<Stderr>),
}

impl Destination {
    /// Opens the destination for the given output path.
    ///
    /// Without a path, the log goes to the diagnostic stream.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::CONFIGURATION`] if the file could not be created.
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(path) => {
                let file = File::create(path)
                    .map_err(|err| anyhow!(Fault::new(errno::CONFIGURATION)).context(err))
                    .with_context(|| format!("Could not create output file {}", path.display()))?;
                Ok(Destination::File(BufWriter::new(file)))
            }
            None => Ok(Destination::Diagnostic(BufWriter::new(io::stderr()))),
        }
    }
}

impl Write for Destination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Destination::File(file) => file.write(buf),
            Destination::Diagnostic(stderr) => stderr.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Destination::File(file) => file.flush(),
            Destination::Diagnostic(stderr) => stderr.flush(),
        }
    }
}

/// The single, append-only consumer of a tracer's log lines.
pub struct FlushSink<W: Write> {
    output: W,
    encoder: LineFormatEncoder,
    lines_written: u64,
}

impl<W: Write> FlushSink<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            encoder: LineFormatEncoder::new(),
            lines_written: 0,
        }
    }

    /// Formats `records` in order and pushes the lines to the output.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::SINK_IO`] if writing to the output failed.
    pub fn write_records(&mut self, records: &[AccessRecord]) -> Result<(), Error> {
        let lines = self
            .encoder
            .encode(records, &mut self.output)
            .and_then(|lines| {
                self.output.flush()?;
                Ok(lines)
            })
            .map_err(sink_failure)?;
        self.lines_written += lines;

        Ok(())
    }

    /// Writes a single free-form line, e.g. a failure message.
    pub fn write_message(&mut self, message: &str) -> Result<(), Error> {
        writeln!(self.output, "{message}")
            .and_then(|_| self.output.flush())
            .map_err(Error::from)
            .map_err(sink_failure)
    }

    /// Number of log lines written so far. Messages are not counted.
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

fn sink_failure(err: Error) -> Error {
    anyhow!(Fault::new(errno::SINK_IO)).context(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use anyhow::Error;
    use gctracer_error::{Fault, errno};

    use crate::tracing::{AccessRecord, OpKind};

    use super::{Destination, FlushSink};

    struct BrokenOutput;

    impl Write for BrokenOutput {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("device unplugged"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_counts_lines() -> Result<(), Error> {
        let mut sink = FlushSink::new(Vec::<u8>::new());
        sink.write_records(&[
            AccessRecord::new(0x1004, 8, OpKind::Read),
            AccessRecord::new(0x2000, 1, OpKind::Write),
        ])?;
        sink.write_message("not a log line")?;

        assert_eq!(sink.lines_written(), 3);
        assert_eq!(
            String::from_utf8(sink.into_inner())?,
            "0x1000 READ    0\n0x1008 READ    0\n0x2000 WRITE   0\nnot a log line\n"
        );

        Ok(())
    }

    #[test]
    fn broken_output_is_a_sink_fault() {
        let mut sink = FlushSink::new(BrokenOutput);
        let err = sink
            .write_records(&[AccessRecord::new(0x10, 4, OpKind::Read)])
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Fault>(),
            Some(&Fault::new(errno::SINK_IO))
        );
    }

    #[test]
    fn file_destination_truncates() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trace.log");
        fs::write(&path, "stale content\n")?;

        let mut sink = FlushSink::new(Destination::open(Some(&path))?);
        sink.write_records(&[AccessRecord::new(0x40, 8, OpKind::InstructionFetch)])?;
        drop(sink);

        assert_eq!(fs::read_to_string(&path)?, "0x40 IFETCH  0\n");

        Ok(())
    }

    #[test]
    fn unwritable_path_is_a_configuration_fault() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let err = match Destination::open(Some(&dir.path().join("missing").join("trace.log"))) {
            Ok(_) => panic!("opening a file in a missing directory should fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<Fault>(),
            Some(&Fault::new(errno::CONFIGURATION))
        );

        Ok(())
    }
}
