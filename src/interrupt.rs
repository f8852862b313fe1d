//! Cooperative run interruption.
//!
//! A sweep must never be killed while an instrument is mid-command, so
//! Ctrl-C does not terminate anything here. For the duration of one
//! orchestrated call an [`InterruptGuard`] owns a listener task on
//! `tokio::signal::ctrl_c()` that only sets an [`InterruptFlag`]; the run
//! loop polls the flag at exactly one point per iteration, after the
//! measurement and before the next setpoint write. Dropping the guard
//! aborts the listener, so sweeps outside an orchestrated call see normal
//! Ctrl-C behavior again and repeated calls never leak a stale listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared cancellation flag polled by run loops.
///
/// Cloning shares the underlying flag. [`trigger`](Self::trigger) may be
/// called from any task, including programmatically in lieu of a signal.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an interrupt has been requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request an interrupt.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear the request. Done once when a guard installs.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Scoped Ctrl-C listener feeding an [`InterruptFlag`].
pub struct InterruptGuard {
    flag: InterruptFlag,
    listener: JoinHandle<()>,
}

impl InterruptGuard {
    /// Clear `flag` and start listening for Ctrl-C until dropped.
    pub fn install(flag: InterruptFlag) -> Self {
        flag.clear();
        let task_flag = flag.clone();
        let listener = tokio::spawn(async move {
            loop {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        log::info!("Interrupt requested; finishing the point in flight");
                        task_flag.trigger();
                    }
                    Err(e) => {
                        log::warn!("Ctrl-C listener unavailable: {e}");
                        break;
                    }
                }
            }
        });
        Self { flag, listener }
    }

    /// The flag this guard feeds.
    pub fn flag(&self) -> InterruptFlag {
        self.flag.clone()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lifecycle() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_set());
        flag.trigger();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        other.trigger();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn test_install_clears_stale_request() {
        let flag = InterruptFlag::new();
        flag.trigger();
        let guard = InterruptGuard::install(flag.clone());
        assert!(!guard.flag().is_set());
        drop(guard);
        // Programmatic triggering still works after the listener is gone.
        flag.trigger();
        assert!(flag.is_set());
    }
}
