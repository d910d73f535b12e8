use std::{
    io::Write,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Error, anyhow, bail};
use gctracer_error::{Fault, errno};

use crate::{
    config::TracerConfig,
    sink::{Destination, FlushSink},
};

mod buffer;
mod guard;
mod region;
mod representation;

pub use buffer::{LOG_CAPACITY, LogBuffer};
pub use guard::FailureGuard;
pub use region::RegionTracker;
pub use representation::{
    AccessEvent, AccessRecord, CHUNK_SIZE, OpKind, RegionEvent, Sentinel, SentinelMatch,
    ThreadId, align_down,
};

/// Message written to both sinks at teardown if the tracer failed.
pub const UNRELIABLE_NOTICE: &str =
    "something failed, results are unreliable; skipping final flush";

/// The substrate side of the tracer.
///
/// The tracer calls [`invalidate`](InstrumentationControl::invalidate)
/// whenever a region opens or closes, since the set of instructions that
/// need hooks changes with it. This is a hint: the tracer filters accesses
/// on its own either way.
pub trait InstrumentationControl: Send + Sync {
    fn invalidate(&self);
}

/// An [`InstrumentationControl`] for substrates that always instrument everything.
pub struct StaticInstrumentation;

impl InstrumentationControl for StaticInstrumentation {
    fn invalidate(&self) {}
}

struct TracerState<W: Write> {
    region: RegionTracker,
    buffer: LogBuffer,
    sink: FlushSink<W>,
    closed: bool,
}

/// Records the memory accesses of one thread while a region is open.
///
/// Region transitions, the access filter and the log buffer live behind a
/// single [`Mutex`] that every event locks once, so events delivered by
/// many application threads are applied one at a time.
pub struct Tracer<W: Write = Destination> {
    state: Mutex<TracerState<W>>,
    guard: FailureGuard,
    sentinel_match: SentinelMatch,
    control: Arc<dyn InstrumentationControl>,
}

impl Tracer<Destination> {
    /// Creates a tracer writing to the destination named by `config`.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::CONFIGURATION`] if `config` is invalid or the
    /// output file could not be created.
    pub fn from_config(
        config: &TracerConfig,
        control: Arc<dyn InstrumentationControl>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let destination = Destination::open(config.output.as_deref())?;

        match &config.output {
            Some(path) => log::info!("Writing access log to {}", path.display()),
            None => log::info!("Writing access log to the diagnostic stream"),
        }

        Ok(TracerBuilder::new(destination)
            .sentinel_match(config.sentinel_match)
            .instrumentation(control)
            .build())
    }
}

impl<W: Write> Tracer<W> {
    /// Creates a tracer with default settings writing to `output`.
    pub fn new(output: W) -> Self {
        TracerBuilder::new(output).build()
    }

    fn lock(&self) -> Result<MutexGuard<'_, TracerState<W>>, Error> {
        match self.state.lock() {
            Ok(state) => Ok(state),
            Err(_) => Err(anyhow!(Fault::new(errno::LOCK_POISONED))
                .context("Tracer Lock Poisoned: Could not access tracer state!")),
        }
    }

    fn check_usable(&self, state: &TracerState<W>) -> Result<(), Error> {
        if self.guard.is_failed() {
            bail!(Fault::new(errno::TRACER_FAILED))
        }
        if state.closed {
            bail!(Fault::new(errno::TRACER_CLOSED))
        }
        Ok(())
    }

    /// Handles a call of the routine `name` on `thread`.
    ///
    /// Returns the sentinel the routine was matched to, if any. Calls of
    /// other routines are ignored.
    pub fn on_routine_call(&self, thread: ThreadId, name: &str) -> Result<Option<Sentinel>, Error> {
        match Sentinel::match_routine(name, self.sentinel_match) {
            Some(kind) => {
                self.on_region_event(RegionEvent { kind, thread })?;
                Ok(Some(kind))
            }
            None => Ok(None),
        }
    }

    /// Applies a region boundary to the region state.
    ///
    /// The substrate is asked to recompute its instrumentation after the
    /// lock is released.
    pub fn on_region_event(&self, event: RegionEvent) -> Result<(), Error> {
        let (invalidate, tracing) = {
            let mut state = self.lock()?;
            self.check_usable(&state)?;
            let invalidate = state.region.apply(event.kind, event.thread);
            (invalidate, state.region.is_tracing())
        };

        log::debug!(
            "{} on thread {} (tracing: {tracing})",
            event.kind.routine_name(),
            event.thread
        );

        if invalidate {
            self.control.invalidate();
        }

        Ok(())
    }

    /// Handles a single memory operand.
    ///
    /// Returns `true` if the access passed the filter and was recorded.
    ///
    /// # Errors
    ///
    /// - [`errno::UNRECOGNIZED_ACCESS_KIND`] if the kind is unknown. This is
    ///   fatal: the tracer is marked as failed before returning.
    /// - [`errno::SINK_IO`] if the buffer filled up and could not be
    ///   flushed. This is fatal as well.
    /// - [`errno::TRACER_FAILED`] or [`errno::TRACER_CLOSED`] if the tracer
    ///   does not accept events anymore.
    #[inline]
    pub fn on_access(&self, event: AccessEvent) -> Result<bool, Error> {
        if self.guard.is_failed() {
            bail!(Fault::new(errno::TRACER_FAILED))
        }

        let op = match OpKind::try_from_id(event.kind) {
            Ok(op) => op,
            Err(err) => {
                let message = format!(
                    "didn't recognize mem op type: {} (thread {}, address 0x{:X})",
                    event.kind, event.thread, event.address
                );
                self.mark_failed(&message);
                return Err(err);
            }
        };

        let mut state = self.lock()?;
        self.check_usable(&state)?;

        if !state.region.should_record(event.thread) {
            return Ok(false);
        }
        if event.size == 0 {
            log::trace!("Dropped zero-sized access at 0x{:X}", event.address);
            return Ok(false);
        }

        let TracerState { buffer, sink, .. } = &mut *state;
        if let Err(err) = buffer.append(event.address, event.size, op, |records| {
            sink.write_records(records)
        }) {
            self.guard.set();
            log::error!("Could not flush the log buffer: {err:#}");
            return Err(err);
        }

        Ok(true)
    }

    /// Marks the output of this tracer as unreliable.
    ///
    /// `message` is written to the primary sink and the diagnostic stream.
    /// Every event delivered afterwards is rejected, and teardown skips the
    /// final flush.
    pub fn mark_failed(&self, message: &str) {
        // The guard is set under the lock, so no event or teardown can
        // observe the state in between.
        match self.lock() {
            Ok(mut state) => {
                self.guard.set();
                let written = if state.closed {
                    Ok(())
                } else {
                    state.sink.write_message(message)
                };
                if let Err(err) = written {
                    log::error!("Could not write failure message to the log: {err:#}");
                }
            }
            Err(err) => {
                self.guard.set();
                log::error!("{err:#}");
            }
        }
        log::error!("{message}");
    }

    /// Tears the tracer down in place.
    ///
    /// Unless the tracer failed, all buffered records are flushed. A failed
    /// tracer writes [`UNRELIABLE_NOTICE`] to both sinks instead. Closing
    /// twice is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if self.guard.is_failed() {
            log::error!("{UNRELIABLE_NOTICE}");
            return state.sink.write_message(UNRELIABLE_NOTICE);
        }

        let TracerState { buffer, sink, .. } = &mut *state;
        if let Err(err) = buffer.flush(|records| sink.write_records(records)) {
            self.guard.set();
            log::error!("Could not write the final flush: {err:#}");
            return Err(err);
        }

        log::info!(
            "Tracer closed after writing {} log lines",
            state.sink.lines_written()
        );

        Ok(())
    }

    /// Tears the tracer down and hands back its output.
    pub fn finish(self) -> Result<W, Error> {
        self.close()?;
        match self.state.into_inner() {
            Ok(state) => Ok(state.sink.into_inner()),
            Err(_) => Err(anyhow!(Fault::new(errno::LOCK_POISONED))
                .context("Tracer Lock Poisoned: Could not retrieve the output!")),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.guard.is_failed()
    }

    pub fn is_tracing(&self) -> bool {
        self.lock()
            .map(|state| state.region.is_tracing())
            .unwrap_or(false)
    }

    /// Number of records waiting for the next flush.
    pub fn buffered(&self) -> Result<usize, Error> {
        Ok(self.lock()?.buffer.len())
    }

    /// Number of log lines written to the sink so far.
    pub fn lines_written(&self) -> Result<u64, Error> {
        Ok(self.lock()?.sink.lines_written())
    }
}

/// A builder for [`Tracer`] instances.
pub struct TracerBuilder<W: Write> {
    output: W,
    capacity: usize,
    sentinel_match: SentinelMatch,
    control: Arc<dyn InstrumentationControl>,
}

impl<W: Write> TracerBuilder<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            capacity: LOG_CAPACITY,
            sentinel_match: SentinelMatch::Exact,
            control: Arc::new(StaticInstrumentation),
        }
    }

    /// Sets the number of records buffered between two flushes.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn sentinel_match(mut self, matching: SentinelMatch) -> Self {
        self.sentinel_match = matching;
        self
    }

    pub fn instrumentation(mut self, control: Arc<dyn InstrumentationControl>) -> Self {
        self.control = control;
        self
    }

    /// Consumes this builder to create a new [`Tracer`] instance.
    pub fn build(self) -> Tracer<W> {
        Tracer {
            state: Mutex::new(TracerState {
                region: RegionTracker::new(),
                buffer: LogBuffer::with_capacity(self.capacity),
                sink: FlushSink::new(self.output),
                closed: false,
            }),
            guard: FailureGuard::new(),
            sentinel_match: self.sentinel_match,
            control: self.control,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use anyhow::Error;
    use gctracer_error::{Fault, errno};
    use rand_xoshiro::{
        Xoshiro256PlusPlus,
        rand_core::{RngCore, SeedableRng},
    };

    use super::{
        AccessEvent, InstrumentationControl, OpKind, RegionEvent, Sentinel, SentinelMatch,
        Tracer, TracerBuilder, UNRELIABLE_NOTICE,
    };

    #[derive(Default)]
    struct CountingControl {
        invalidations: AtomicUsize,
    }

    impl InstrumentationControl for CountingControl {
        fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn begin(tracer: &Tracer<impl Write>, thread: u32) -> Result<(), Error> {
        tracer.on_region_event(RegionEvent {
            kind: Sentinel::Begin,
            thread,
        })
    }

    fn end(tracer: &Tracer<impl Write>, thread: u32) -> Result<(), Error> {
        tracer.on_region_event(RegionEvent {
            kind: Sentinel::End,
            thread,
        })
    }

    fn output(tracer: Tracer<Vec<u8>>) -> Result<String, Error> {
        Ok(String::from_utf8(tracer.finish()?)?)
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fault_of(err: &Error) -> Option<i32> {
        err.downcast_ref::<Fault>().map(Fault::errno)
    }

    #[test]
    fn single_access_in_region() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 5)?;
        assert!(tracer.on_access(AccessEvent::new(5, 0x1000, 4, OpKind::Read))?);
        end(&tracer, 5)?;
        tracer.on_routine_call(5, "pin_simulation_exit")?;

        assert_eq!(output(tracer)?, "0x1000 READ    0\n");
        Ok(())
    }

    #[test]
    fn straddling_access_emits_two_lines() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 5)?;
        tracer.on_access(AccessEvent::new(5, 0x1004, 8, OpKind::Read))?;

        assert_eq!(output(tracer)?, "0x1000 READ    0\n0x1008 READ    0\n");
        Ok(())
    }

    #[test]
    fn access_before_begin_is_dropped() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        assert!(!tracer.on_access(AccessEvent::new(5, 0x1000, 4, OpKind::Read))?);
        begin(&tracer, 5)?;
        end(&tracer, 5)?;

        assert_eq!(output(tracer)?, "");
        Ok(())
    }

    #[test]
    fn access_after_end_is_dropped() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 5)?;
        tracer.on_access(AccessEvent::new(5, 0x10, 8, OpKind::Write))?;
        end(&tracer, 5)?;
        assert!(!tracer.on_access(AccessEvent::new(5, 0x20, 8, OpKind::Write))?);

        assert_eq!(output(tracer)?, "0x10 WRITE   0\n");
        Ok(())
    }

    #[test]
    fn other_threads_are_dropped() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 5)?;
        for thread in [0, 1, 4, 6, 100] {
            assert!(!tracer.on_access(AccessEvent::new(thread, 0x1000, 4, OpKind::Read))?);
        }

        assert_eq!(output(tracer)?, "");
        Ok(())
    }

    #[test]
    fn zero_sized_access_is_dropped() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 1)?;
        assert!(!tracer.on_access(AccessEvent::new(1, 0x1000, 0, OpKind::Read))?);

        assert_eq!(output(tracer)?, "");
        Ok(())
    }

    #[test]
    fn regions_can_be_reopened() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x8, 1, OpKind::InstructionFetch))?;
        end(&tracer, 1)?;
        begin(&tracer, 2)?;
        tracer.on_access(AccessEvent::new(1, 0x10, 1, OpKind::Read))?;
        tracer.on_access(AccessEvent::new(2, 0x18, 1, OpKind::Write))?;
        end(&tracer, 2)?;

        assert_eq!(output(tracer)?, "0x8 IFETCH  0\n0x18 WRITE   0\n");
        Ok(())
    }

    #[test]
    fn routine_names_are_matched_exactly_by_default() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        assert_eq!(tracer.on_routine_call(3, "_Z20pin_simulation_beginv")?, None);
        assert!(!tracer.is_tracing());
        assert_eq!(
            tracer.on_routine_call(3, "pin_simulation_begin")?,
            Some(Sentinel::Begin)
        );
        assert!(tracer.is_tracing());
        Ok(())
    }

    #[test]
    fn substring_matching_can_be_enabled() -> Result<(), Error> {
        let tracer = TracerBuilder::new(Vec::<u8>::new())
            .sentinel_match(SentinelMatch::Substring)
            .build();
        assert_eq!(
            tracer.on_routine_call(3, "_Z20pin_simulation_beginv")?,
            Some(Sentinel::Begin)
        );
        assert!(tracer.is_tracing());
        Ok(())
    }

    #[test]
    fn instrumentation_is_invalidated_on_transitions() -> Result<(), Error> {
        let control = Arc::new(CountingControl::default());
        let tracer = TracerBuilder::new(Vec::<u8>::new())
            .instrumentation(control.clone())
            .build();

        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x10, 4, OpKind::Read))?;
        tracer.on_routine_call(1, "pin_simulation_exit")?;
        tracer.on_routine_call(1, "malloc")?;
        end(&tracer, 1)?;

        assert_eq!(control.invalidations.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn full_buffer_is_flushed_in_order() -> Result<(), Error> {
        let tracer = TracerBuilder::new(Vec::<u8>::new()).capacity(4).build();
        begin(&tracer, 9)?;

        for i in 0..4_u64 {
            tracer.on_access(AccessEvent::new(9, i * 8, 8, OpKind::Read))?;
        }
        assert_eq!(tracer.buffered()?, 0);
        assert_eq!(tracer.lines_written()?, 4);

        tracer.on_access(AccessEvent::new(9, 32, 8, OpKind::Write))?;
        assert_eq!(tracer.buffered()?, 1);

        let expected: String = [
            "0x0 READ    0",
            "0x8 READ    0",
            "0x10 READ    0",
            "0x18 READ    0",
            "0x20 WRITE   0\n",
        ]
        .join("\n");
        assert_eq!(output(tracer)?, expected);
        Ok(())
    }

    #[test]
    fn line_count_over_many_flushes() -> Result<(), Error> {
        let tracer = TracerBuilder::new(Vec::<u8>::new()).capacity(64).build();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut expected_lines = 0;

        begin(&tracer, 0)?;
        for _ in 0..1000 {
            let address = rng.next_u64() >> 4;
            let size = rng.next_u32() % 32 + 1;
            let op = OpKind::try_from_id(rng.next_u32() % 3)?;
            tracer.on_access(AccessEvent::new(0, address, size, op))?;
            expected_lines += (address + u64::from(size) - 1) / 8 - address / 8 + 1;
        }

        assert_eq!(output(tracer)?.lines().count() as u64, expected_lines);
        Ok(())
    }

    #[test]
    fn unrecognized_kind_fails_the_tracer() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 5)?;
        tracer.on_access(AccessEvent::new(5, 0x1000, 4, OpKind::Read))?;

        let err = tracer
            .on_access(AccessEvent {
                thread: 5,
                address: 0x2000,
                size: 4,
                kind: 7,
            })
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::UNRECOGNIZED_ACCESS_KIND));
        assert!(tracer.is_failed());

        let err = tracer
            .on_access(AccessEvent::new(5, 0x3000, 4, OpKind::Read))
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::TRACER_FAILED));
        let err = end(&tracer, 5).unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::TRACER_FAILED));

        let log = output(tracer)?;
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("didn't recognize mem op type: 7"));
        assert_eq!(lines[1], UNRELIABLE_NOTICE);
        Ok(())
    }

    #[test]
    fn unrecognized_kind_fails_outside_a_region_too() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        tracer
            .on_access(AccessEvent {
                thread: 1,
                address: 0,
                size: 1,
                kind: u32::MAX,
            })
            .unwrap_err();
        assert!(tracer.is_failed());
        Ok(())
    }

    #[test]
    fn events_after_close_are_rejected() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x40, 2, OpKind::Read))?;
        tracer.close()?;
        tracer.close()?;

        let err = tracer
            .on_access(AccessEvent::new(1, 0x48, 2, OpKind::Read))
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::TRACER_CLOSED));

        assert_eq!(output(tracer)?, "0x40 READ    0\n");
        Ok(())
    }

    #[test]
    fn failed_final_flush_fails_the_tracer() -> Result<(), Error> {
        let tracer = Tracer::new(FullDisk);
        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x10, 4, OpKind::Read))?;
        assert!(!tracer.is_failed());

        let err = tracer.close().unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::SINK_IO));
        assert!(tracer.is_failed());
        Ok(())
    }

    #[test]
    fn failed_capacity_flush_fails_the_tracer() -> Result<(), Error> {
        let tracer = TracerBuilder::new(FullDisk).capacity(2).build();
        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x10, 4, OpKind::Read))?;

        let err = tracer
            .on_access(AccessEvent::new(1, 0x20, 4, OpKind::Read))
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::SINK_IO));
        assert!(tracer.is_failed());

        let err = tracer
            .on_access(AccessEvent::new(1, 0x30, 4, OpKind::Read))
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::TRACER_FAILED));
        assert_eq!(tracer.buffered()?, 2);
        Ok(())
    }

    #[test]
    fn failure_skips_the_final_flush() -> Result<(), Error> {
        let tracer = Tracer::new(Vec::<u8>::new());
        begin(&tracer, 1)?;
        tracer.on_access(AccessEvent::new(1, 0x10, 4, OpKind::Read))?;
        tracer.mark_failed("lost track of the region");
        assert!(tracer.is_failed());

        let err = tracer
            .on_access(AccessEvent::new(1, 0x18, 4, OpKind::Read))
            .unwrap_err();
        assert_eq!(fault_of(&err), Some(errno::TRACER_FAILED));
        assert_eq!(
            output(tracer)?,
            format!("lost track of the region\n{UNRELIABLE_NOTICE}\n")
        );
        Ok(())
    }

    #[test]
    fn finishing_an_empty_tracer_writes_nothing() -> Result<(), Error> {
        assert_eq!(output(Tracer::new(Vec::<u8>::new()))?, "");
        Ok(())
    }

    #[test]
    fn concurrent_threads_only_record_the_active_one() -> Result<(), Error> {
        let tracer = Arc::new(TracerBuilder::new(Vec::<u8>::new()).capacity(100).build());
        begin(&*tracer, 0)?;

        let handles: Vec<_> = (0..4_u32)
            .map(|thread| {
                let tracer = tracer.clone();
                thread::spawn(move || -> Result<(), Error> {
                    for i in 0..1000_u64 {
                        tracer.on_access(AccessEvent::new(thread, i * 8, 8, OpKind::Write))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Worker thread panicked")?;
        }

        let tracer = Arc::into_inner(tracer).expect("All workers were joined");
        let log = output(tracer)?;
        let addresses: Vec<u64> = log
            .lines()
            .map(|line| {
                let hex = line.split(' ').next().unwrap().trim_start_matches("0x");
                u64::from_str_radix(hex, 16).unwrap()
            })
            .collect();

        assert_eq!(addresses, (0..1000_u64).map(|i| i * 8).collect::<Vec<_>>());
        Ok(())
    }
}
