//! Operation scheduler
//!
//! The [`Objecter`] turns a composite [`Operation`] into an in-flight request:
//!
//! 1. `submit()` binds the completion, finalizes the operation and spawns a
//!    request task, then returns without waiting.
//! 2. The task acquires throttle budget and hands the serialized request to
//!    the [`Transport`].
//! 3. The acknowledgment is demultiplexed into per-sub-operation results and
//!    moves the completion to Submitted (or Failed for a rejected batch).
//! 4. The commit future moves it to Durable.
//!
//! Each step past submission runs under the configured operation timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::completion::{Callback, Completion, Phase};
use crate::config::ObjecterConfig;
use crate::demux::{demux, SubOpResult};
use crate::error::{errno, AioError, Failure, Result};
use crate::operation::{FinalizedOp, Operation};
use crate::throttle::Throttle;
use crate::tracker::{InFlightGuard, Tracker};
use crate::transport::{Ack, Transport};
use crate::types::CompletionId;

/// Submits operations and drives their completions
pub struct Objecter {
    transport: Arc<dyn Transport>,
    throttle: Arc<Throttle>,
    tracker: Arc<Tracker>,
    next_tid: AtomicU64,
    next_completion: AtomicU64,
    runtime: Handle,
}

impl Objecter {
    /// Create a scheduler on the current tokio runtime
    pub fn new(transport: Arc<dyn Transport>, config: &ObjecterConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| AioError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(transport, config, runtime))
    }

    /// Create a scheduler that spawns request tasks on `runtime`
    pub fn with_runtime(
        transport: Arc<dyn Transport>,
        config: &ObjecterConfig,
        runtime: Handle,
    ) -> Self {
        let throttle = config.throttle();
        info!(
            "Creating Objecter: inflight_ops={}, inflight_bytes={}, op_timeout={:?}",
            throttle.max_ops(),
            throttle.max_bytes(),
            config.rados_osd_op_timeout.0
        );
        Self {
            transport,
            throttle: Arc::new(throttle),
            tracker: Arc::new(Tracker::new(config.tracker_config())),
            next_tid: AtomicU64::new(1),
            next_completion: AtomicU64::new(1),
            runtime,
        }
    }

    /// Create a detached completion with optional phase callbacks
    pub fn create_completion(
        &self,
        on_submitted: Option<Callback>,
        on_durable: Option<Callback>,
    ) -> Completion {
        let id = CompletionId(self.next_completion.fetch_add(1, Ordering::Relaxed));
        trace!("created completion {}", id);
        Completion::new(id, on_submitted, on_durable)
    }

    /// Submit `op`, reporting progress through `completion`
    ///
    /// Returns once the request task is spawned. Misuse (a completion that is
    /// already bound, terminal or released, or an operation that was already
    /// submitted) fails here; everything after is reported on the completion.
    pub fn submit(&self, op: &mut Operation, completion: &Completion) -> Result<()> {
        completion.bind()?;

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let finalized = match op.finalize(tid) {
            Ok(finalized) => finalized,
            Err(e) => {
                completion.unbind();
                return Err(e);
            }
        };

        debug!(
            "submitting tid={} completion={} {} on {}: {} ops, budget={}",
            tid,
            completion.id(),
            finalized.manifest.kind,
            finalized.request.address,
            finalized.manifest.len(),
            finalized.manifest.budget
        );

        let ctx = RequestContext {
            transport: self.transport.clone(),
            throttle: self.throttle.clone(),
            tracker: self.tracker.clone(),
            completion: completion.clone(),
            _in_flight: self.tracker.start(),
        };
        let handle = self.runtime.spawn(ctx.run(finalized));
        completion.set_abort_handle(handle.abort_handle());
        Ok(())
    }

    /// Submit and wait for durability (rados_write_op_operate analogue)
    ///
    /// A failed batch is reported as its failure; use [`Objecter::submit`]
    /// to inspect per-sub-operation results of a failed batch.
    pub async fn operate(&self, op: &mut Operation) -> Result<Vec<SubOpResult>> {
        let completion = self.create_completion(None, None);
        self.submit(op, &completion)?;
        completion.wait_for_phase(Phase::Durable).await?;

        let outcome = match completion.failure()? {
            Some(failure) => Err(failure.into()),
            None => completion.results(),
        };
        completion.release()?;
        outcome
    }

    /// Wait until every submitted request has finished (rados_aio_flush)
    pub async fn flush(&self) {
        debug!("flushing {} in-flight requests", self.tracker.in_flight());
        self.tracker.flush().await;
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }
}

/// Everything one request task owns
struct RequestContext {
    transport: Arc<dyn Transport>,
    throttle: Arc<Throttle>,
    tracker: Arc<Tracker>,
    completion: Completion,
    _in_flight: InFlightGuard,
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        // the task panicked or was torn down before the request settled
        if matches!(self.completion.poll(), Ok(phase) if !phase.is_terminal()) {
            warn!(
                "completion {}: request task ended before the request settled",
                self.completion.id()
            );
            self.completion.fail(
                Failure::Transport {
                    code: errno::EIO,
                    message: "request task ended before the request settled".into(),
                },
                None,
                None,
            );
        }
    }
}

impl RequestContext {
    async fn run(self, finalized: FinalizedOp) {
        let FinalizedOp { request, manifest } = finalized;
        let tid = request.tid;
        let id = self.completion.id();

        let _permit = match self.throttle.acquire(manifest.budget).await {
            Ok(permit) => permit,
            Err(e) => {
                self.completion.fail(
                    Failure::Transport {
                        code: errno::EIO,
                        message: e.to_string(),
                    },
                    None,
                    None,
                );
                return;
            }
        };
        trace!(
            "tid={} acquired throttle: budget={} bytes, current_ops={}, current_bytes={}",
            tid,
            manifest.budget,
            self.throttle.current_ops(),
            self.throttle.current_bytes()
        );

        if !self.completion.mark_sent() {
            debug!("tid={} completion={} cancelled before send", tid, id);
            return;
        }

        let Ack { reply, commit } = match self.tracker.run(self.transport.send(request)).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                warn!("tid={} completion={} transport failed: {}", tid, id, e);
                self.completion.fail(
                    Failure::Transport {
                        code: e.code,
                        message: e.message,
                    },
                    None,
                    None,
                );
                return;
            }
            Err(limit) => {
                warn!("tid={} completion={} timed out after {:?}", tid, id, limit);
                self.completion.fail(Failure::TimedOut(limit), None, None);
                return;
            }
        };

        let result = reply.result;
        let version = reply.version;
        let results = match demux(&manifest, reply) {
            Ok(results) => results,
            Err(AioError::ProtocolMismatch { expected, actual }) => {
                self.completion
                    .fail(Failure::Protocol { expected, actual }, None, Some(version));
                return;
            }
            Err(e) => {
                self.completion.fail(
                    Failure::Transport {
                        code: errno::EPROTO,
                        message: e.to_string(),
                    },
                    None,
                    Some(version),
                );
                return;
            }
        };

        if result < 0 {
            debug!(
                "tid={} completion={} rejected by store: result={}",
                tid, id, result
            );
            self.completion
                .fail(Failure::Remote { code: result }, Some(results), Some(version));
            return;
        }

        debug!("tid={} completion={} acked, version={}", tid, id, version);
        if !self.completion.mark_submitted(result, version, results) {
            // settled by another path while the ack was in flight
            return;
        }

        match self.tracker.run(commit).await {
            Ok(Ok(())) => {
                debug!("tid={} completion={} durable", tid, id);
                self.completion.mark_durable();
            }
            Ok(Err(e)) => {
                warn!("tid={} completion={} commit failed: {}", tid, id, e);
                self.completion.fail(
                    Failure::Transport {
                        code: e.code,
                        message: e.message,
                    },
                    None,
                    None,
                );
            }
            Err(limit) => {
                warn!(
                    "tid={} completion={} commit timed out after {:?}",
                    tid, id, limit
                );
                self.completion.fail(Failure::TimedOut(limit), None, None);
            }
        }
    }
}
