//! Process-wide serialization of mutating handlers
//!
//! Every handler that writes shared state (cluster status, instances,
//! Service bindings, node annotations) holds the guard for its whole run.
//! Frontend allocation is a scan of live instances followed by a create, and
//! nothing but this lock keeps two allocations from picking the same address.
//!
//! The lock is a `tokio::sync::Mutex`, so waiters park instead of blocking a
//! runtime thread, and the permit can be held across `.await`.

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// The single lock shared by all handlers
#[derive(Debug, Default)]
pub struct SerializationGuard {
    lock: Mutex<()>,
}

impl SerializationGuard {
    /// Create an unlocked guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock. Released when the returned permit is dropped.
    pub async fn enter(&self, operation: &'static str, object: impl Into<String>) -> GuardPermit<'_> {
        let object = object.into();
        debug!(operation, %object, "waiting for handler lock");
        let guard = self.lock.lock().await;
        debug!(operation, %object, "handler lock acquired");
        GuardPermit {
            _guard: guard,
            operation,
            object,
            acquired: Instant::now(),
        }
    }
}

/// Proof that the holder runs exclusively
pub struct GuardPermit<'a> {
    _guard: MutexGuard<'a, ()>,
    operation: &'static str,
    object: String,
    acquired: Instant,
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            object = %self.object,
            held_ms = self.acquired.elapsed().as_millis() as u64,
            "handler lock released"
        );
    }
}
