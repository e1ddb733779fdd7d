//! Time source for polling loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Injectable clock so bounded waits can be driven deterministically.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` returns immediately and advances `now`.
///
/// Every requested sleep is recorded, so tests can assert poll intervals.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.with_state(|s| s.elapsed)
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.with_state(|s| s.sleeps.clone())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManualState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.with_state(|s| {
            s.elapsed += duration;
            s.sleeps.push(duration);
        });
    }
}
