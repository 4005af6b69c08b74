//! Cancellation handle shared between a transfer and whoever may abort it.
//!
//! Firing is a channel disconnect: every clone holds the receiving end, and
//! the single sender is dropped on `cancel()`. Watchers can block on it with
//! `crossbeam_channel::select!` alongside their own completion signal.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes disconnected once the token fires
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
