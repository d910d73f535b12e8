use std::{
    io::{BufRead, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Error, anyhow};
use gctracer_core::{
    Tracer,
    tracing::{AccessEvent, InstrumentationControl, OpKind, ThreadId},
};
use gctracer_error::{Fault, errno};

/// A single line of an event script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    /// `call <tid> <routine>`
    Call { thread: ThreadId, routine: String },

    /// `read|write|ifetch <tid> <addr> <size>` or `access <tid> <addr> <size> <kind>`
    Access(AccessEvent),
}

/// A parsed event script, ready to be replayed through a [`Tracer`].
///
/// Scripts are plain text with one event per line:
///
/// ```text
/// # the collector starts on thread 5
/// call 5 pin_simulation_begin
/// read 5 0x1000 4
/// write 5 0x1004 8
/// ifetch 5 0x400000 4
/// access 5 0x2000 4 0
/// call 5 pin_simulation_end
/// ```
///
/// Addresses are decimal or `0x`-prefixed hex. `access` carries the raw kind
/// as delivered by a substrate (0 = read, 1 = write, 2 = fetch).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    events: Vec<ScriptEvent>,
}

/// Summary of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayReport {
    /// Number of events delivered to the tracer
    pub events: u64,

    /// Number of accesses that passed the filter
    pub recorded: u64,

    /// Number of instrumentation invalidations requested by the tracer
    pub invalidations: u64,
}

/// The [`InstrumentationControl`] of a replay.
///
/// A script can not be re-instrumented, so the requests are only counted.
#[derive(Default)]
pub struct ReplaySubstrate {
    invalidations: AtomicU64,
}

impl ReplaySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl InstrumentationControl for ReplaySubstrate {
    fn invalidate(&self) {
        let epoch = self.invalidations.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Instrumentation invalidated (epoch {epoch})");
    }
}

fn parse_number<T: TryFrom<u64>>(token: &str, what: &str) -> Result<T, Error> {
    let value = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse::<u64>(),
    }
    .map_err(|err| anyhow!("Invalid {what} `{token}`: {err}"))?;

    T::try_from(value).map_err(|_| anyhow!("{what} `{token}` is out of range"))
}

fn parse_line(line: &str) -> Result<Option<ScriptEvent>, Error> {
    let line = match line.split_once('#') {
        Some((content, _)) => content,
        None => line,
    };
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let event = match tokens.as_slice() {
        [] => return Ok(None),
        ["call", thread, routine] => ScriptEvent::Call {
            thread: parse_number(thread, "thread id")?,
            routine: routine.to_string(),
        },
        [op @ ("read" | "write" | "ifetch"), thread, address, size] => {
            let op = match *op {
                "read" => OpKind::Read,
                "write" => OpKind::Write,
                _ => OpKind::InstructionFetch,
            };
            ScriptEvent::Access(AccessEvent::new(
                parse_number(thread, "thread id")?,
                parse_number(address, "address")?,
                parse_number(size, "size")?,
                op,
            ))
        }
        ["access", thread, address, size, kind] => ScriptEvent::Access(AccessEvent {
            thread: parse_number(thread, "thread id")?,
            address: parse_number(address, "address")?,
            size: parse_number(size, "size")?,
            kind: parse_number(kind, "access kind")?,
        }),
        [keyword, ..] => return Err(anyhow!("Unknown or malformed event `{keyword}`")),
    };

    Ok(Some(event))
}

impl Script {
    /// Parses a whole script before any event is delivered.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::CONFIGURATION`] naming the first malformed line,
    /// or if `input` could not be read.
    pub fn parse<R: BufRead>(input: R) -> Result<Self, Error> {
        let mut events = Vec::new();
        for (idx, line) in input.lines().enumerate() {
            let line = line
                .map_err(|err| anyhow!(Fault::new(errno::CONFIGURATION)).context(err))
                .context("Could not read event script")?;
            match parse_line(&line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => continue,
                Err(err) => {
                    return Err(anyhow!(Fault::new(errno::CONFIGURATION))
                        .context(format!("Line {}: {err}", idx + 1)));
                }
            }
        }

        Ok(Self { events })
    }

    pub fn events(&self) -> &[ScriptEvent] {
        &self.events
    }

    /// Delivers all events to `tracer` in script order.
    ///
    /// Stops at the first error, which is fatal for the tracer.
    pub fn replay<W: Write>(&self, tracer: &Tracer<W>) -> Result<ReplayReport, Error> {
        let mut report = ReplayReport::default();

        for event in &self.events {
            report.events += 1;
            match event {
                ScriptEvent::Call { thread, routine } => {
                    tracer.on_routine_call(*thread, routine)?;
                }
                ScriptEvent::Access(access) => {
                    if tracer.on_access(*access)? {
                        report.recorded += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}
