//! The C ABI through which a native instrumentation substrate drives gctracer.
//!
//! A substrate loads this library, calls [`gctracer_init`] once before the
//! target program starts, forwards routine calls and memory operands while
//! the program runs and calls [`gctracer_fini`] when the program exits.
//!
//! All functions return one of the codes defined in [`gctracer_error::errno`].
//! [`gctracer_access`] never returns a fatal code: if an access can not be
//! logged correctly, the process is aborted after the failure was reported.

use std::{
    ffi::{CStr, c_char},
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use anyhow::Error;
use gctracer_core::{
    Tracer, TracerConfig,
    tracing::{AccessEvent, InstrumentationControl, RegionEvent, Sentinel, SentinelMatch},
};
use gctracer_error::{errno, errno_description};

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// Callback asking the substrate to recompute its instrumentation.
pub type InvalidateCallback = extern "C" fn();

struct CallbackInstrumentation {
    callback: Option<InvalidateCallback>,
}

impl InstrumentationControl for CallbackInstrumentation {
    fn invalidate(&self) {
        if let Some(callback) = self.callback {
            callback()
        }
    }
}

fn errno_of(err: &Error) -> i32 {
    gctracer_core::fault_code(err).unwrap_or(errno::INTERNAL)
}

fn report(result: Result<(), Error>) -> i32 {
    match result {
        Ok(()) => errno::NO_ERROR,
        Err(err) => {
            log::error!("{err:#}");
            errno_of(&err)
        }
    }
}

/// # Safety
///
/// `ptr` must be null or point to a nul-terminated string.
unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_str().ok()
    }
}

fn tracer() -> Result<&'static Tracer, i32> {
    TRACER.get().ok_or(errno::NOT_INITIALIZED)
}

/// Creates the process-wide tracer.
///
/// The log is written to the file at `output_path`, or to stderr if
/// `output_path` is null. If `substring_match` is `true`, routines are
/// recognized as sentinels if their name contains a sentinel name rather
/// than being equal to it. `invalidate` is called whenever a region opens
/// or closes and may be null.
///
/// Diagnostics are configured from the log4rs file named by the
/// `GCTRACER_LOG_CONFIG` environment variable, or go to stderr.
///
/// # Safety
///
/// `output_path` must be null or point to a nul-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gctracer_init(
    output_path: *const c_char,
    substring_match: bool,
    invalidate: Option<InvalidateCallback>,
) -> i32 {
    if TRACER.get().is_some() {
        return errno::ALREADY_INITIALIZED;
    }

    if let Err(err) = gctracer_core::diagnostics::init_from_env() {
        eprintln!("gctracer: could not set up diagnostics: {err:#}");
    }

    let output = if output_path.is_null() {
        None
    } else {
        match unsafe { read_str(output_path) } {
            Some(path) => Some(PathBuf::from(path)),
            None => return errno::INVALID_ARGUMENT,
        }
    };

    let config = TracerConfig {
        output,
        sentinel_match: if substring_match {
            SentinelMatch::Substring
        } else {
            SentinelMatch::Exact
        },
    };

    let control = Arc::new(CallbackInstrumentation {
        callback: invalidate,
    });
    match Tracer::from_config(&config, control) {
        Ok(tracer) => match TRACER.set(tracer) {
            Ok(()) => errno::NO_ERROR,
            Err(_) => errno::ALREADY_INITIALIZED,
        },
        Err(err) => {
            log::error!("{err:#}");
            errno_of(&err)
        }
    }
}

/// Reports that `thread` called the routine named `name`.
///
/// Routines other than the sentinels are ignored.
///
/// # Safety
///
/// `name` must point to a nul-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gctracer_routine_call(thread: u32, name: *const c_char) -> i32 {
    let tracer = match tracer() {
        Ok(tracer) => tracer,
        Err(code) => return code,
    };
    let Some(name) = (unsafe { read_str(name) }) else {
        return errno::INVALID_ARGUMENT;
    };

    report(tracer.on_routine_call(thread, name).map(|_| ()))
}

/// Reports a region boundary directly, `kind` being 0 (begin), 1 (end) or 2 (exit).
#[unsafe(no_mangle)]
pub extern "C" fn gctracer_region_event(kind: u32, thread: u32) -> i32 {
    let tracer = match tracer() {
        Ok(tracer) => tracer,
        Err(code) => return code,
    };

    report(
        Sentinel::try_from_id(kind).and_then(|kind| tracer.on_region_event(RegionEvent { kind, thread })),
    )
}

/// Reports a memory operand of `size` bytes at `address`.
///
/// `kind` is 0 for reads, 1 for writes and 2 for instruction fetches.
///
/// # Panics
///
/// Aborts the process if the access can not be logged correctly, i.e. its
/// kind is unknown or the log could not be written.
#[unsafe(no_mangle)]
pub extern "C" fn gctracer_access(thread: u32, address: u64, size: u32, kind: u32) -> i32 {
    let tracer = match tracer() {
        Ok(tracer) => tracer,
        Err(code) => return code,
    };

    match tracer.on_access(AccessEvent {
        thread,
        address,
        size,
        kind,
    }) {
        Ok(_) => errno::NO_ERROR,
        Err(err) => match errno_of(&err) {
            errno::TRACER_CLOSED => errno::TRACER_CLOSED,
            code => {
                log::error!("{}: {err:#}", errno_description(code));
                std::process::abort()
            }
        },
    }
}

/// Flushes the log and closes the tracer.
///
/// If the tracer failed earlier, the buffered records are discarded and a
/// notice is written instead.
#[unsafe(no_mangle)]
pub extern "C" fn gctracer_fini() -> i32 {
    match tracer() {
        Ok(tracer) => report(tracer.close()),
        Err(code) => code,
    }
}
