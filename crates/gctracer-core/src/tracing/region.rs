use super::representation::{Sentinel, ThreadId};

/// Tracks which thread, if any, is currently being traced.
///
/// Every transition returns whether the substrate has to recompute its
/// instrumentation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegionTracker {
    active_thread: Option<ThreadId>,
    tracing: bool,
}

impl RegionTracker {
    pub const fn new() -> Self {
        Self {
            active_thread: None,
            tracing: false,
        }
    }

    /// Starts a region traced on `thread`.
    pub fn on_begin(&mut self, thread: ThreadId) -> bool {
        if self.tracing && self.active_thread != Some(thread) {
            log::debug!(
                "Region begin on thread {thread} replaces the active region of thread {:?}",
                self.active_thread
            );
        }
        self.active_thread = Some(thread);
        self.tracing = true;
        true
    }

    /// Ends the current region, no matter which thread started it.
    pub fn on_end(&mut self, thread: ThreadId) -> bool {
        if self.active_thread != Some(thread) {
            log::debug!(
                "Region end on thread {thread} while thread {:?} is active",
                self.active_thread
            );
        }
        self.tracing = false;
        true
    }

    /// Reserved for the exit sentinel. Does not change any state.
    pub fn on_exit(&mut self, _thread: ThreadId) -> bool {
        false
    }

    /// Applies the transition belonging to `sentinel`.
    pub fn apply(&mut self, sentinel: Sentinel, thread: ThreadId) -> bool {
        match sentinel {
            Sentinel::Begin => self.on_begin(thread),
            Sentinel::End => self.on_end(thread),
            Sentinel::Exit => self.on_exit(thread),
        }
    }

    /// The access filter: only the active thread is recorded, and only
    /// while a region is open.
    #[inline]
    pub fn should_record(&self, thread: ThreadId) -> bool {
        self.tracing && self.active_thread == Some(thread)
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.active_thread
    }
}
