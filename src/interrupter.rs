use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A capability returning a non-empty reason when the batch must halt
/// cooperatively. Polled at every suspension point of every task (spec §5).
pub trait Interrupter: Send + Sync {
    /// `Some(reason)` once the batch should stop; sticky once set.
    fn reason(&self) -> Option<String>;

    fn check(&self) -> bool {
        self.reason().is_some()
    }
}

/// An interrupter that never fires. Used when the caller has no cancellation
/// source of its own (tests, simple programmatic callers).
#[derive(Debug, Default)]
pub struct NeverInterrupted;

impl Interrupter for NeverInterrupted {
    fn reason(&self) -> Option<String> {
        None
    }
}

/// Flag-backed interrupter a caller can fire from another task, e.g. a
/// `tokio::signal::ctrl_c()` listener in `main.rs`.
#[derive(Debug, Clone, Default)]
pub struct FlagInterrupter {
    fired: Arc<AtomicBool>,
    reason: Arc<std::sync::Mutex<Option<String>>>,
}

impl FlagInterrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, reason: impl Into<String>) {
        // last-write-wins: a sticky flag with whatever reason got there first
        // is fine too, but keeping the latest makes logs easier to read.
        *self.reason.lock().unwrap() = Some(reason.into());
        self.fired.store(true, Ordering::SeqCst);
    }
}

impl Interrupter for FlagInterrupter {
    fn reason(&self) -> Option<String> {
        if self.fired.load(Ordering::SeqCst) {
            self.reason.lock().unwrap().clone()
        } else {
            None
        }
    }
}
