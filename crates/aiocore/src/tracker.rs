//! Request tracker for timeout handling and in-flight accounting

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Configuration for request tracking
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Per-request timeout (rados_osd_op_timeout); zero disables it
    pub operation_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks in-flight requests and bounds how long each may take
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            config,
            in_flight: Arc::new(tx),
        }
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        if self.config.operation_timeout.is_zero() {
            None
        } else {
            Some(self.config.operation_timeout)
        }
    }

    /// Register one in-flight request until the guard drops
    pub fn start(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no request is in flight
    pub async fn flush(&self) {
        let mut rx = self.in_flight.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Run `fut` under the operation timeout, returning the limit on expiry
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Duration>
    where
        F: Future<Output = T>,
    {
        match self.operation_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
            None => Ok(fut.await),
        }
    }
}

/// Keeps a request counted as in flight
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
