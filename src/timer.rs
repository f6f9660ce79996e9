//! Idle watchdog used by [`crate::dialogue::DialogueState`].
//!
//! Mirrors the background-ticking timer in the original Python dialogue
//! handler: a dedicated thread increments `elapsed` once a second for the
//! lifetime of the `Timer`, independent of whether it is currently
//! `active`. `active` only gates [`Timer::is_timed_out`], so
//! `disable_until_reset` can silence a timeout without having to stop and
//! restart the ticking thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

struct Shared {
    elapsed_secs: AtomicU64,
    active: AtomicBool,
    stop: AtomicBool,
}

/// A one-second-resolution idle timer with a default 300s timeout.
pub struct Timer {
    timeout_secs: u64,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            elapsed_secs: AtomicU64::new(0),
            active: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        });
        let ticker = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            while !ticker.stop.load(Ordering::Relaxed) {
                thread::sleep(TICK);
                ticker.elapsed_secs.fetch_add(1, Ordering::Relaxed);
            }
        });
        tracing::debug!("Timer started...");
        Self {
            timeout_secs: timeout.as_secs(),
            shared,
            handle: Some(handle),
        }
    }

    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_secs(300))
    }

    /// Zero the elapsed counter and re-arm `is_timed_out`.
    pub fn reset(&self) {
        self.shared.elapsed_secs.store(0, Ordering::Relaxed);
        self.shared.active.store(true, Ordering::Relaxed);
    }

    /// Silence `is_timed_out` until the next [`Timer::reset`].
    pub fn disable_until_reset(&self) {
        self.shared.active.store(false, Ordering::Relaxed);
    }

    pub fn is_timed_out(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
            && self.shared.elapsed_secs.load(Ordering::Relaxed) > self.timeout_secs
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.shared.elapsed_secs.load(Ordering::Relaxed)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!("Timer closed.");
    }
}
