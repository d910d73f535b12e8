use std::sync::atomic::{AtomicBool, Ordering};

/// A flag that, once set, marks all output of a tracer as unreliable.
///
/// The flag can be read without taking the tracer lock and can never be
/// reset.
#[derive(Debug, Default)]
pub struct FailureGuard {
    failed: AtomicBool,
}

impl FailureGuard {
    pub const fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
        }
    }

    /// Sets the flag. Returns `true` if it was not set before.
    pub fn set(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
