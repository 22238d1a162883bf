//! In-flight request throttling
//!
//! Bounds both the number of requests in flight and the bytes they carry,
//! the way objecter_inflight_ops / objecter_inflight_op_bytes do. Permits
//! are owned so a spawned request task can carry its budget with it; the
//! budget returns when the task finishes or is aborted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AioError, Result};

/// objecter_inflight_ops default
pub const DEFAULT_MAX_OPS: usize = 1024;
/// objecter_inflight_op_bytes default (100 MB)
pub const DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;

/// Operation throttle
#[derive(Debug)]
pub struct Throttle {
    max_ops: usize,
    max_bytes: usize,
    ops_sem: Arc<Semaphore>,
    bytes_sem: Arc<Semaphore>,
    current_ops: Arc<AtomicUsize>,
    current_bytes: Arc<AtomicUsize>,
}

impl Throttle {
    /// Create a new throttle; zero limits are raised to one
    pub fn new(max_ops: usize, max_bytes: usize) -> Self {
        let max_ops = max_ops.clamp(1, Semaphore::MAX_PERMITS);
        // acquire_many takes a u32
        let max_bytes = max_bytes.clamp(1, u32::MAX as usize);
        Self {
            max_ops,
            max_bytes,
            ops_sem: Arc::new(Semaphore::new(max_ops)),
            bytes_sem: Arc::new(Semaphore::new(max_bytes)),
            current_ops: Arc::new(AtomicUsize::new(0)),
            current_bytes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn default_limits() -> Self {
        Self::new(DEFAULT_MAX_OPS, DEFAULT_MAX_BYTES)
    }

    /// A request larger than the whole byte budget takes all of it rather
    /// than waiting forever
    fn clamp_budget(&self, bytes: usize) -> usize {
        bytes.min(self.max_bytes)
    }

    /// Acquire budget for one request, waiting while the limits are exceeded
    pub async fn acquire(&self, bytes: usize) -> Result<ThrottlePermit> {
        let bytes = self.clamp_budget(bytes);

        let op_permit = self
            .ops_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AioError::InvalidState("throttle closed".into()))?;

        let bytes_permit = if bytes > 0 {
            Some(
                self.bytes_sem
                    .clone()
                    .acquire_many_owned(bytes as u32)
                    .await
                    .map_err(|_| AioError::InvalidState("throttle closed".into()))?,
            )
        } else {
            None
        };

        Ok(self.account(op_permit, bytes_permit, bytes))
    }

    /// Try to acquire budget without waiting
    pub fn try_acquire(&self, bytes: usize) -> Option<ThrottlePermit> {
        let bytes = self.clamp_budget(bytes);
        let op_permit = self.ops_sem.clone().try_acquire_owned().ok()?;
        let bytes_permit = if bytes > 0 {
            Some(
                self.bytes_sem
                    .clone()
                    .try_acquire_many_owned(bytes as u32)
                    .ok()?,
            )
        } else {
            None
        };
        Some(self.account(op_permit, bytes_permit, bytes))
    }

    fn account(
        &self,
        op_permit: OwnedSemaphorePermit,
        bytes_permit: Option<OwnedSemaphorePermit>,
        bytes: usize,
    ) -> ThrottlePermit {
        self.current_ops.fetch_add(1, Ordering::Relaxed);
        self.current_bytes.fetch_add(bytes, Ordering::Relaxed);
        ThrottlePermit {
            current_ops: self.current_ops.clone(),
            current_bytes: self.current_bytes.clone(),
            _op_permit: op_permit,
            _bytes_permit: bytes_permit,
            bytes,
        }
    }

    pub fn current_ops(&self) -> usize {
        self.current_ops.load(Ordering::Relaxed)
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes.load(Ordering::Relaxed)
    }

    pub fn max_ops(&self) -> usize {
        self.max_ops
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

/// RAII guard that releases throttle budget when dropped
#[derive(Debug)]
pub struct ThrottlePermit {
    current_ops: Arc<AtomicUsize>,
    current_bytes: Arc<AtomicUsize>,
    _op_permit: OwnedSemaphorePermit,
    _bytes_permit: Option<OwnedSemaphorePermit>,
    bytes: usize,
}

impl ThrottlePermit {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.current_ops.fetch_sub(1, Ordering::Relaxed);
        self.current_bytes.fetch_sub(self.bytes, Ordering::Relaxed);
        // semaphore permits are released when the fields drop
    }
}
