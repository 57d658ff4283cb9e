//! Admission gate for controlled shutdown.
//!
//! Update processing holds a shared permit for the duration of each apply.
//! `close` takes the exclusive side, which waits for outstanding permits,
//! and then marks the gate closed. New permits are refused as soon as
//! shutdown begins; callers are never queued behind it.

use crate::error::MetricError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct GateInner {
    lock: Arc<RwLock<()>>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    closed_token: CancellationToken,
}

/// Shared admission gate; clones refer to the same gate
#[derive(Clone)]
pub struct ShutdownGate {
    inner: Arc<GateInner>,
}

/// Shared permit, released on drop
pub struct GatePermit {
    _guard: OwnedRwLockReadGuard<()>,
    inner: Arc<GateInner>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownGate {
    pub fn new() -> Self {
        ShutdownGate {
            inner: Arc::new(GateInner {
                lock: Arc::new(RwLock::new(())),
                shutting_down: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                closed_token: CancellationToken::new(),
            }),
        }
    }

    /// Take a shared permit, or fail with `ShuttingDown`
    pub fn enter(&self) -> Result<GatePermit, MetricError> {
        if self.is_shutting_down() {
            return Err(MetricError::ShuttingDown);
        }
        let guard = self
            .inner
            .lock
            .clone()
            .try_read_owned()
            .map_err(|_| MetricError::ShuttingDown)?;
        // close() may have started between the flag check and the read
        if self.is_shutting_down() {
            return Err(MetricError::ShuttingDown);
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(GatePermit {
            _guard: guard,
            inner: self.inner.clone(),
        })
    }

    /// Refuse new permits, wait for outstanding ones, then mark closed.
    /// Calling it again after the gate closed returns immediately.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        debug!(in_flight = self.in_flight(), "shutdown gate closing");

        let _exclusive = self.inner.lock.write().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.closed_token.cancel();
        info!("shutdown gate closed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once the gate has closed
    pub async fn closed(&self) {
        self.inner.closed_token.cancelled().await
    }
}
