//! Injectable time source.
//!
//! The identifier store stamps emissions with [`Clock::now`] and the pumps
//! suspend with [`Clock::sleep`]. Tests use [`ManualClock`] to move time by
//! hand; production code uses [`SystemClock`].

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;

/// Monotonic elapsed-time source and delay primitive.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Complete once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by `tokio::time` (so it follows a paused test runtime too).
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when [`ManualClock::advance`] is called.
pub struct ManualClock {
    now: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Duration::ZERO);
        Self { now }
    }

    /// Move time forward, waking every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &*self.now.borrow()).finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut rx = self.now.subscribe();
        let deadline = rx.borrow().saturating_add(duration);
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Clock dropped: time never moves again.
                    std::future::pending::<()>().await;
                }
            }
        })
    }
}
