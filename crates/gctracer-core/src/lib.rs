//! The recording core of gctracer.
//!
//! An instrumentation substrate delivers two kinds of events to a
//! [`Tracer`](tracing::Tracer): region boundaries, raised whenever the
//! target program calls one of the sentinel routines, and memory accesses.
//! While a region is open, the accesses of the thread that opened it are
//! buffered and eventually written as chunk-aligned text lines.

/// Startup configuration of the tracer
pub mod config;

/// Setup of the diagnostic stream
pub mod diagnostics;

mod line_format;

/// Output destinations of the access log
pub mod sink;

/// Region tracking, access filtering and buffering
pub mod tracing;

pub use config::TracerConfig;
pub use line_format::LineFormatEncoder;
pub use tracing::{Tracer, TracerBuilder};

/// Recovers the [`errno`](gctracer_error::errno) code carried by `err`, if any.
pub fn fault_code(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<gctracer_error::Fault>()
        .map(gctracer_error::Fault::errno)
}
