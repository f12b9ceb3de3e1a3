//! Broadcast completion signals.
//!
//! A [`Signal`] starts pending and fires at most once. Any number of tasks
//! may check it or wait on it; firing never consumes anything, so late
//! observers see the fired state immediately. The orchestrator uses these
//! for per-service readiness and completion, and the mDNS server uses one
//! to tell its listeners to shut down.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;

/// A cloneable, fire-once broadcast signal.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create a pending signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Create a signal that has already fired.
    pub fn fired() -> Self {
        let signal = Self::new();
        signal.fire();
        signal
    }

    /// Fire the signal. Returns `true` if this call performed the
    /// transition, `false` if it had already fired.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a
        // closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// True iff every signal has fired. Vacuously true for an empty slice.
pub fn all_fired(signals: &[Signal]) -> bool {
    signals.iter().all(Signal::is_fired)
}

/// Wait until every signal has fired.
pub async fn wait_all(signals: &[Signal]) {
    join_all(signals.iter().map(|s| s.wait())).await;
}

/// Return a new signal that fires once all of `signals` have fired.
///
/// An empty input yields an already-fired signal. Otherwise a task is
/// spawned on the current runtime to fan the inputs in, so this must be
/// called from within a tokio runtime.
pub fn when_all_fired(signals: Vec<Signal>) -> Signal {
    if all_fired(&signals) {
        return Signal::fired();
    }

    let combined = Signal::new();
    let out = combined.clone();
    tokio::spawn(async move {
        wait_all(&signals).await;
        out.fire();
    });
    combined
}
