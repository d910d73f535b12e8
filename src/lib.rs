use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Error, anyhow};
use gctracer_error::{Fault, errno};

pub use gctracer_core::{
    LineFormatEncoder, Tracer, TracerBuilder, TracerConfig, fault_code,
    tracing::{
        AccessEvent, AccessRecord, InstrumentationControl, OpKind, RegionEvent, Sentinel,
        SentinelMatch, StaticInstrumentation, ThreadId,
    },
};

use crate::replay::{ReplayReport, ReplaySubstrate, Script};

/// Replays textual event scripts through the tracer.
pub mod replay;

/// Creates a [`Tracer`] writing to the destination named by `config`.
///
/// `control` is notified whenever a region opens or closes.
///
/// # Errors
///
/// Fails with [`errno::CONFIGURATION`] if the configuration is invalid or
/// the output file could not be created.
///
/// # Examples
/// ```no_run
/// # use anyhow::Error;
/// # use std::sync::Arc;
/// # use gctracer::{AccessEvent, OpKind, RegionEvent, Sentinel, StaticInstrumentation, TracerConfig};
/// # fn main() -> Result<(), Error> {
/// let config = TracerConfig::new().with_output("trace.log");
/// let tracer = gctracer::tracer(&config, Arc::new(StaticInstrumentation))?;
///
/// tracer.on_region_event(RegionEvent { kind: Sentinel::Begin, thread: 5 })?;
/// tracer.on_access(AccessEvent::new(5, 0x1000, 4, OpKind::Read))?;
/// tracer.on_region_event(RegionEvent { kind: Sentinel::End, thread: 5 })?;
///
/// tracer.close()?;
/// # Ok(())
/// # }
/// ```
pub fn tracer(
    config: &TracerConfig,
    control: Arc<dyn InstrumentationControl>,
) -> Result<Tracer, Error> {
    Tracer::from_config(config, control)
}

/// Parses the event script at `script` and replays it through a new tracer.
///
/// The whole script is parsed before the tracer is created, so a malformed
/// script never produces any output. The tracer is closed afterwards even
/// if an event was fatal, in which case the final flush is skipped and the
/// error of that event is returned.
///
/// # Errors
///
/// - [`errno::CONFIGURATION`] if the script could not be read or parsed, or
///   `config` is invalid.
/// - Any fatal tracer error raised by one of the events.
pub fn replay<P: AsRef<Path>>(script: P, config: &TracerConfig) -> Result<ReplayReport, Error> {
    let path = script.as_ref();
    let file = File::open(path)
        .map_err(|err| anyhow!(Fault::new(errno::CONFIGURATION)).context(err))
        .with_context(|| format!("Could not open event script {}", path.display()))?;
    let script = Script::parse(BufReader::new(file))?;
    log::info!(
        "Parsed {} events from {}",
        script.events().len(),
        path.display()
    );

    let substrate = Arc::new(ReplaySubstrate::new());
    let tracer = tracer(config, substrate.clone())?;

    let outcome = script.replay(&tracer);
    let closed = tracer.close();

    let report = ReplayReport {
        invalidations: substrate.invalidations(),
        ..outcome?
    };
    closed?;

    log::info!(
        "Replayed {} events, {} accesses recorded, {} log lines written",
        report.events,
        report.recorded,
        tracer.lines_written()?
    );

    Ok(report)
}
