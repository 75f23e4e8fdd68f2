//! Progress reporting and cooperative cancellation for long-running work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Receives coarse progress updates from import steps.
///
/// Logging happens through `tracing` regardless; this trait exists so a
/// frontend can additionally render a progress bar per named action.
pub trait Progress {
    fn set_action(&mut self, action: &str);
    fn set_progress(&mut self, current: u64, total: u64);
}

/// Default [`Progress`] sink that forwards to `tracing`.
///
/// Percentage updates are throttled to whole-percent changes.
#[derive(Debug, Default)]
pub struct LogProgress {
    action: String,
    last_percent: u64,
}

impl Progress for LogProgress {
    fn set_action(&mut self, action: &str) {
        action.clone_into(&mut self.action);
        self.last_percent = 0;
        info!(action, "starting");
    }

    fn set_progress(&mut self, current: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = current.saturating_mul(100) / total;
        if percent > self.last_percent {
            self.last_percent = percent;
            info!(action = self.action, percent, "progress");
        }
    }
}

/// A shared cancellation token.
///
/// Long loops poll [`Breaker::is_aborted`] between units of work and bail
/// out without producing a result. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct Breaker {
    aborted: Arc<AtomicBool>,
}

impl Breaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Safe to call from any thread.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}
