//! Scheduler - time source and cancellable waits for the driver loop
//!
//! The driver never sleeps directly. It asks a `Scheduler` for the current
//! time and waits for deadlines through it, so tests can substitute a manual
//! clock and step through round deadlines deterministically.

use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use fedchain_types::Timestamp;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable cancellation signal shared by the driver and its owner
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation of every pending wait
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this cannot fail
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Current time in unix milliseconds
    fn now_millis(&self) -> i64;

    /// Current time in unix seconds
    fn now(&self) -> Timestamp {
        self.now_millis().div_euclid(1000)
    }

    /// Wait until `deadline_millis`, or fail with `Cancelled` on shutdown
    async fn wait_until(&self, deadline_millis: i64, shutdown: &Shutdown) -> Result<()>;
}

/// Wall clock backed by tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScheduler;

#[async_trait]
impl Scheduler for SystemScheduler {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn wait_until(&self, deadline_millis: i64, shutdown: &Shutdown) -> Result<()> {
        if shutdown.is_triggered() {
            return Err(CoordinatorError::Cancelled);
        }
        let remaining = deadline_millis - self.now_millis();
        if remaining <= 0 {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => Ok(()),
            _ = shutdown.cancelled() => Err(CoordinatorError::Cancelled),
        }
    }
}

/// Manually driven clock for deterministic tests
///
/// `wait_until` jumps the clock straight to the deadline.
#[derive(Debug, Default, Clone)]
pub struct ManualScheduler {
    now_millis: Arc<AtomicI64>,
}

impl ManualScheduler {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_millis: Arc::new(AtomicI64::new(start * 1000)),
        }
    }

    /// Set the clock to `at` seconds
    pub fn set(&self, at: Timestamp) {
        self.now_millis.store(at * 1000, Ordering::SeqCst);
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now_millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    fn now_millis(&self) -> i64 {
        self.now_millis.load(Ordering::SeqCst)
    }

    async fn wait_until(&self, deadline_millis: i64, shutdown: &Shutdown) -> Result<()> {
        if shutdown.is_triggered() {
            return Err(CoordinatorError::Cancelled);
        }
        self.now_millis.fetch_max(deadline_millis, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }
}
