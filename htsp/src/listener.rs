//! ## LISTENER EXECUTION CONTEXTS
//!
//! Every listener registered anywhere in this core (connection-state,
//! auth-state, message) may optionally supply an [Executor] it wants its
//! callback posted onto; absence means the callback runs inline, on
//! whichever thread produced the event (typically the I/O thread). This
//! models the source's callback-posting handles without pulling in any UI
//! framework: an [Executor] is just "a thing messages can be posted to."

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

/// Something a listener callback can be posted onto instead of being run
/// inline on the calling thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs `job` now if `executor` is `None`, otherwise posts it. Catches
/// panics from inline execution so a misbehaving listener can never take
/// down the I/O loop.
pub fn dispatch(executor: &Option<Arc<dyn Executor>>, job: impl FnOnce() + Send + 'static) {
    match executor {
        Some(executor) => executor.execute(Box::new(job)),
        None => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                error!(panic = %msg, "listener panicked during inline dispatch");
            }
        }
    }
}
