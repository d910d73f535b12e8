use std::fmt;

/// Defines all error codes used throughout gctracer
pub mod errno {
    /// Function returned without error
    ///
    /// **Note:** Should never be carried by a [`Fault`](super::Fault).
    /// This would make no sense!
    pub const NO_ERROR: i32 = 0;

    /// Configuration error: The tracer could not be set up as requested
    ///
    /// This error is emitted if the startup invocation was invalid, e.g.
    /// the output path points to a directory or a replay script could
    /// not be parsed. Tracing never begins in this case.
    pub const CONFIGURATION: i32 = 1;

    /// Fatal error: An access event carried an unknown operation kind
    ///
    /// The substrate delivered an access whose kind is neither a read,
    /// a write nor an instruction fetch. The tracer refuses to log it
    /// and marks its output as unreliable.
    pub const UNRECOGNIZED_ACCESS_KIND: i32 = 2;

    /// Fatal error: Writing to the output sink failed
    pub const SINK_IO: i32 = 3;

    /// Internal error: The lock guarding the tracer state was poisoned
    ///
    /// This can happen if another thread panicked while holding the
    /// lock on the tracer state.
    pub const LOCK_POISONED: i32 = 4;

    /// The tracer rejected an event because it failed earlier
    pub const TRACER_FAILED: i32 = 5;

    /// The tracer rejected an event because it was closed already
    pub const TRACER_CLOSED: i32 = 6;

    /// C ABI error: An event was delivered before `gctracer_init`
    pub const NOT_INITIALIZED: i32 = 7;

    /// C ABI error: `gctracer_init` was called more than once
    pub const ALREADY_INITIALIZED: i32 = 8;

    /// C ABI error: A pointer or enum argument was invalid
    ///
    /// Emitted if a string argument was null or not valid UTF-8, or if
    /// a region event kind was not recognized.
    pub const INVALID_ARGUMENT: i32 = 9;

    /// Internal error: A failure that carries no other code
    ///
    /// Reported at the process boundaries for errors that were not
    /// raised as a [`Fault`](super::Fault).
    pub const INTERNAL: i32 = 10;
}

/// Returns a string describing the error based on the given error code `errno`
pub fn errno_description(errno: i32) -> String {
    match errno {
        0 => "No Error".into(),
        1 => "Configuration Error: Invalid tracer configuration".into(),
        2 => "Fatal Error: Unrecognized memory access kind".into(),
        3 => "Fatal Error: Could not write to the output sink".into(),
        4 => "Internal Error: Tracer lock was poisoned".into(),
        5 => "Tracer Error: Tracer failed earlier, results are unreliable".into(),
        6 => "Tracer Error: Tracer was closed already".into(),
        7 => "ABI Error: Tracer was not initialized".into(),
        8 => "ABI Error: Tracer was initialized twice".into(),
        9 => "ABI Error: Invalid argument".into(),
        10 => "Internal Error: Unclassified failure".into(),
        _ => "Unknown error!".into(),
    }
}

/// An error value carrying one of the [`errno`] codes.
///
/// The tracer wraps it into its regular error type so the process
/// boundaries (exit code, C ABI return value) can recover the code
/// by downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    errno: i32,
}

impl Fault {
    pub const fn new(errno: i32) -> Self {
        Self { errno }
    }

    pub const fn errno(&self) -> i32 {
        self.errno
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&errno_description(self.errno))
    }
}

impl std::error::Error for Fault {}
