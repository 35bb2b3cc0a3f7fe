//! Cooperative abort signalling.
//!
//! The caller keeps a clone of [`AbortHandle`] and calls [`AbortHandle::abort`]; the
//! executor polls the flag at loop boundaries and before blocking hardware calls. An
//! abort never interrupts an instrument call already in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// A shared, lock-free stop flag with an optional reason.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl AbortHandle {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the running sequence to stop.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Request a stop and record why.
    pub fn abort_with_reason(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
        self.abort();
    }

    /// True once a stop was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given with the stop request.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear the flag so the next run starts clean.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }
}
