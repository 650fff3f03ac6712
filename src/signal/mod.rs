//! Signal handling for interrupting a launch (SIGINT/SIGTERM)
//!
//! On the first signal the monitor stops polling at its next check and
//! the launch ends with `Cancelled`; the remote build keeps running and
//! can be inspected with `agent-launch status <JOB_ID>`.
//!
//! On a second signal the process exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

/// Exit code for cancelled launches
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// Longest uninterrupted slice of a cancel-aware sleep
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation state
#[derive(Debug, Default)]
pub struct SignalState {
    /// First signal received (cancellation initiated)
    cancel_requested: AtomicBool,
    /// Second signal received (immediate exit requested)
    immediate_exit: AtomicBool,
    /// Signal count (for tracking double-SIGINT)
    signal_count: AtomicU8,
    /// Build being monitored, reported when exiting early
    active_job: Mutex<Option<String>>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Check if immediate exit has been requested (double-SIGINT)
    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Request cancellation without a signal
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Handle a signal (SIGINT/SIGTERM)
    ///
    /// Returns the appropriate action to take
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            self.cancel_requested.store(true, Ordering::SeqCst);
            SignalAction::InitiateCancellation
        } else if count == 1 {
            self.immediate_exit.store(true, Ordering::SeqCst);
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }

    /// Record the build currently being monitored
    pub fn set_active_job(&self, job_id: &str) {
        if let Ok(mut job) = self.active_job.lock() {
            *job = Some(job_id.to_string());
        }
    }

    pub fn clear_active_job(&self) {
        if let Ok(mut job) = self.active_job.lock() {
            *job = None;
        }
    }

    pub fn active_job(&self) -> Option<String> {
        self.active_job.lock().ok().and_then(|job| job.clone())
    }

    /// Sleep for `duration`, waking early on cancellation
    ///
    /// Returns false if cancellation was requested before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_cancel_requested() {
                return false;
            }
            let remaining = duration.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }

    /// Reset the signal state (for testing)
    pub fn reset(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.immediate_exit.store(false, Ordering::SeqCst);
        self.signal_count.store(0, Ordering::SeqCst);
        self.clear_active_job();
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop monitoring at the next check
    InitiateCancellation,
    /// Second signal: exit immediately
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Installs the process signal handler over a shared [`SignalState`]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn with_state(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the signal handlers
    ///
    /// Must be called once at program startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                warn!("interrupt received, stopping after the current poll (press again to exit now)");
            }
            SignalAction::ImmediateExit => {
                match state.active_job() {
                    Some(job_id) => warn!(job_id = %job_id, "exiting; the remote build keeps running"),
                    None => warn!("exiting immediately"),
                }
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
