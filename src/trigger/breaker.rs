//! Circuit breaker guarding AI calls made by subscription executions.
//!
//! Opens after a run of consecutive failures; while open, executions fail
//! fast with a cooldown reason and retries are disabled. After the
//! cooldown one probe is allowed through (half-open).

use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold,
            cooldown,
        }
    }

    /// Whether calls should be rejected right now. After the cooldown the
    /// breaker half-opens and lets a probe through.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.opened_at {
            Some(opened) if opened.elapsed() < self.cooldown => true,
            Some(_) => {
                // Half-open: allow the next call; a failure re-opens.
                state.opened_at = None;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }
}
