//! Completion state machine
//!
//! A [`Completion`] tracks one submitted operation through
//! `Pending -> Submitted -> Durable`, or into `Failed` from either of the
//! first two phases. Durable and Failed are terminal.
//!
//! Each completion has two callback slots, one for the Submitted phase and
//! one for the Durable phase. A slot fires at most once. Callbacks never run
//! under the completion's lock: they are queued and drained by whichever
//! thread drove the transition, one thread at a time, so the Submitted
//! callback always returns before the Durable callback starts. When the
//! completion fails, every slot still holding a callback fires with an event
//! whose phase is `Failed`.
//!
//! Waiting is supported from async code ([`Completion::wait_for_phase`]) and
//! from plain threads ([`Completion::wait_for_phase_blocking`]).

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace};

use crate::demux::SubOpResult;
use crate::error::{errno, AioError, Failure, Result};
use crate::types::CompletionId;

/// Observable lifecycle phase of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    /// Acknowledged: applied by the store, results available
    Submitted,
    /// Persisted by the store
    Durable,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Durable | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::Submitted => "submitted",
            Phase::Durable => "durable",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot handed to a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub id: CompletionId,
    pub phase: Phase,
    pub return_value: i32,
    pub version: u64,
    pub failure: Option<Failure>,
}

/// Phase callback
pub type Callback = Box<dyn FnOnce(&CompletionEvent) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Submitted,
    Durable,
    Failed(Failure),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Pending => Phase::Pending,
            State::Submitted => Phase::Submitted,
            State::Durable => Phase::Durable,
            State::Failed(_) => Phase::Failed,
        }
    }

    fn can_enter(&self, next: &State) -> bool {
        matches!(
            (self, next),
            (State::Pending, State::Submitted)
                | (State::Pending, State::Failed(_))
                | (State::Submitted, State::Durable)
                | (State::Submitted, State::Failed(_))
        )
    }
}

enum Slot {
    Empty,
    Registered(Callback),
    /// Phase fired with no callback registered
    Passed,
    Queued,
    Fired,
}

impl Slot {
    /// Nothing left to run for this slot
    fn is_settled(&self) -> bool {
        !matches!(self, Slot::Registered(_) | Slot::Queued)
    }
}

const SUBMITTED_SLOT: usize = 0;
const DURABLE_SLOT: usize = 1;

fn slots_for(phase: Phase) -> &'static [usize] {
    match phase {
        Phase::Pending => &[],
        Phase::Submitted => &[SUBMITTED_SLOT],
        Phase::Durable => &[DURABLE_SLOT],
        Phase::Failed => &[SUBMITTED_SLOT, DURABLE_SLOT],
    }
}

/// Whether a completion in `state` has gone at least as far as `target`
///
/// Failure ends every wait, so waiting for Durable (or Failed) means
/// waiting for a terminal phase.
fn reached(state: &State, target: Phase) -> bool {
    match target {
        Phase::Pending => true,
        Phase::Submitted => state.phase() != Phase::Pending,
        Phase::Durable | Phase::Failed => state.phase().is_terminal(),
    }
}

struct Inner {
    state: State,
    return_value: i32,
    version: u64,
    results: Option<Vec<SubOpResult>>,
    slots: [Slot; 2],
    queue: VecDeque<(usize, Callback, CompletionEvent)>,
    delivering: bool,
    bound: bool,
    /// The request was handed to the transport
    sent: bool,
    released: bool,
    abort: Option<AbortHandle>,
}

impl Inner {
    fn failure(&self) -> Option<Failure> {
        match &self.state {
            State::Failed(f) => Some(f.clone()),
            _ => None,
        }
    }
}

struct Shared {
    id: CompletionId,
    inner: Mutex<Inner>,
    cond: Condvar,
    generation: watch::Sender<u64>,
}

/// Handle to the asynchronous lifecycle of one operation
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Completion")
            .field("id", &self.shared.id)
            .field("phase", &inner.state.phase())
            .field("bound", &inner.bound)
            .field("sent", &inner.sent)
            .field("released", &inner.released)
            .finish()
    }
}

impl Completion {
    pub(crate) fn new(
        id: CompletionId,
        on_submitted: Option<Callback>,
        on_durable: Option<Callback>,
    ) -> Self {
        let slot = |cb: Option<Callback>| cb.map_or(Slot::Empty, Slot::Registered);
        let (generation, _rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                id,
                inner: Mutex::new(Inner {
                    state: State::Pending,
                    return_value: 0,
                    version: 0,
                    results: None,
                    slots: [slot(on_submitted), slot(on_durable)],
                    queue: VecDeque::new(),
                    delivering: false,
                    bound: false,
                    sent: false,
                    released: false,
                    abort: None,
                }),
                cond: Condvar::new(),
                generation,
            }),
        }
    }

    pub fn id(&self) -> CompletionId {
        self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // callbacks never run under the lock, so a poisoned lock still
        // guards consistent state
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.shared.cond.notify_all();
        self.shared.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn released_error(&self) -> AioError {
        AioError::InvalidState(format!("completion {} was released", self.id()))
    }

    fn live(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.released {
            return Err(self.released_error());
        }
        Ok(inner)
    }

    fn event(&self, inner: &Inner, phase: Phase) -> CompletionEvent {
        CompletionEvent {
            id: self.id(),
            phase,
            return_value: inner.return_value,
            version: inner.version,
            failure: inner.failure(),
        }
    }

    // ============= Transitions =============

    /// Attach the completion to an operation being submitted
    pub(crate) fn bind(&self) -> Result<()> {
        let mut inner = self.live()?;
        if inner.bound {
            return Err(AioError::InvalidState(format!(
                "completion {} is already bound to an operation",
                self.id()
            )));
        }
        if inner.state != State::Pending {
            return Err(AioError::InvalidState(format!(
                "completion {} is already {}",
                self.id(),
                inner.state.phase()
            )));
        }
        inner.bound = true;
        Ok(())
    }

    /// Undo [`Completion::bind`] when the submission never started
    pub(crate) fn unbind(&self) {
        self.lock().bound = false;
    }

    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        let mut inner = self.lock();
        if inner.state.phase().is_terminal() {
            // cancelled before the task was registered
            drop(inner);
            handle.abort();
            return;
        }
        inner.abort = Some(handle);
    }

    /// Record that the request is about to reach the transport
    ///
    /// Past this point `cancel` can no longer promise the request did not
    /// run. Returns false if the completion is already terminal.
    pub(crate) fn mark_sent(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != State::Pending {
            return false;
        }
        inner.sent = true;
        true
    }

    /// Record the acknowledgment
    pub(crate) fn mark_submitted(
        &self,
        return_value: i32,
        version: u64,
        results: Vec<SubOpResult>,
    ) -> bool {
        self.transition(State::Submitted, false, |inner| {
            inner.return_value = return_value;
            inner.version = version;
            inner.results = Some(results);
        })
    }

    /// Record durability
    pub(crate) fn mark_durable(&self) -> bool {
        self.transition(State::Durable, false, |_| {})
    }

    /// Record a terminal failure
    ///
    /// Results already recorded at acknowledgment are kept unless new ones
    /// are supplied.
    pub(crate) fn fail(
        &self,
        failure: Failure,
        results: Option<Vec<SubOpResult>>,
        version: Option<u64>,
    ) -> bool {
        let return_value = failure.errno();
        self.transition(State::Failed(failure), false, |inner| {
            inner.return_value = return_value;
            if let Some(results) = results {
                inner.results = Some(results);
            }
            if let Some(version) = version {
                inner.version = version;
            }
        })
    }

    fn transition(
        &self,
        next: State,
        unsent_only: bool,
        update: impl FnOnce(&mut Inner),
    ) -> bool {
        let mut inner = self.lock();
        let allowed = !inner.released
            && inner.state.can_enter(&next)
            && (!unsent_only || (inner.state == State::Pending && !inner.sent));
        if !allowed {
            debug!(
                "completion {}: refusing transition {} -> {}",
                self.id(),
                inner.state.phase(),
                next.phase()
            );
            return false;
        }

        trace!(
            "completion {}: {} -> {}",
            self.id(),
            inner.state.phase(),
            next.phase()
        );
        inner.state = next;
        update(&mut *inner);
        if inner.state.phase().is_terminal() {
            inner.abort = None;
        }
        self.schedule_callbacks(&mut inner);
        let deliver = Self::claim_delivery(&mut inner);
        drop(inner);

        self.notify();
        if deliver {
            self.deliver();
        }
        true
    }

    fn schedule_callbacks(&self, inner: &mut Inner) {
        let phase = inner.state.phase();
        for &idx in slots_for(phase) {
            match std::mem::replace(&mut inner.slots[idx], Slot::Passed) {
                Slot::Registered(cb) => {
                    let event = self.event(inner, phase);
                    inner.queue.push_back((idx, cb, event));
                    inner.slots[idx] = Slot::Queued;
                }
                Slot::Empty => {}
                settled => inner.slots[idx] = settled,
            }
        }
    }

    fn claim_delivery(inner: &mut Inner) -> bool {
        if inner.delivering || inner.queue.is_empty() {
            return false;
        }
        inner.delivering = true;
        true
    }

    /// Drain the callback queue; only the thread that claimed delivery runs this
    fn deliver(&self) {
        loop {
            let (idx, cb, event) = {
                let mut inner = self.lock();
                match inner.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        inner.delivering = false;
                        return;
                    }
                }
            };

            trace!("completion {}: running {} callback", self.id(), event.phase);
            if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                error!(
                    "completion {}: callback for {} panicked",
                    self.id(),
                    event.phase
                );
            }

            self.lock().slots[idx] = Slot::Fired;
            self.notify();
        }
    }

    // ============= Caller API =============

    /// Current phase without blocking
    pub fn poll(&self) -> Result<Phase> {
        Ok(self.live()?.state.phase())
    }

    /// Register a callback after creation
    ///
    /// If the phase already passed, the callback is queued for immediate
    /// delivery: this call runs it unless another thread is already
    /// delivering, in which case that thread runs it. `phase` must be
    /// Submitted or Durable.
    pub fn set_callback(&self, phase: Phase, cb: Callback) -> Result<()> {
        let idx = match phase {
            Phase::Submitted => SUBMITTED_SLOT,
            Phase::Durable => DURABLE_SLOT,
            other => {
                return Err(AioError::InvalidOperation(format!(
                    "no callback slot for phase {}",
                    other
                )))
            }
        };

        let mut inner = self.live()?;
        match std::mem::replace(&mut inner.slots[idx], Slot::Empty) {
            Slot::Empty => {
                inner.slots[idx] = Slot::Registered(cb);
                Ok(())
            }
            Slot::Passed => {
                let event_phase = match inner.state.phase() {
                    Phase::Failed => Phase::Failed,
                    _ => phase,
                };
                let event = self.event(&inner, event_phase);
                inner.queue.push_back((idx, cb, event));
                inner.slots[idx] = Slot::Queued;
                let deliver = Self::claim_delivery(&mut inner);
                drop(inner);
                if deliver {
                    self.deliver();
                }
                Ok(())
            }
            taken => {
                inner.slots[idx] = taken;
                Err(AioError::InvalidState(format!(
                    "completion {} already has a {} callback",
                    self.id(),
                    phase
                )))
            }
        }
    }

    /// Whether `phase` was reached and its callback, if any, has returned
    pub fn is_callback_done(&self, phase: Phase) -> Result<bool> {
        let inner = self.live()?;
        Ok(Self::settled(&inner, phase))
    }

    fn settled(inner: &Inner, target: Phase) -> bool {
        reached(&inner.state, target)
            && slots_for(target)
                .iter()
                .all(|&idx| inner.slots[idx].is_settled())
    }

    fn check(&self, target: Phase, with_callback: bool) -> Result<Option<Phase>> {
        let inner = self.live()?;
        let done = if with_callback {
            Self::settled(&inner, target)
        } else {
            reached(&inner.state, target)
        };
        Ok(done.then(|| inner.state.phase()))
    }

    async fn wait_until(&self, target: Phase, with_callback: bool) -> Result<Phase> {
        // subscribe before checking so no transition slips between the two
        let mut rx = self.shared.generation.subscribe();
        loop {
            if let Some(phase) = self.check(target, with_callback)? {
                return Ok(phase);
            }
            if rx.changed().await.is_err() {
                return Err(self.released_error());
            }
        }
    }

    fn wait_until_blocking(&self, target: Phase, with_callback: bool) -> Result<Phase> {
        let mut inner = self.live()?;
        loop {
            let done = if with_callback {
                Self::settled(&inner, target)
            } else {
                reached(&inner.state, target)
            };
            if done {
                return Ok(inner.state.phase());
            }
            inner = self
                .shared
                .cond
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
            if inner.released {
                return Err(self.released_error());
            }
        }
    }

    /// Wait until `target` is reached, returning the phase observed
    ///
    /// A failure ends the wait for any target; `Phase::Failed` as the target
    /// waits for either terminal phase.
    pub async fn wait_for_phase(&self, target: Phase) -> Result<Phase> {
        self.wait_until(target, false).await
    }

    /// Like [`Completion::wait_for_phase`], for threads outside the runtime
    pub fn wait_for_phase_blocking(&self, target: Phase) -> Result<Phase> {
        self.wait_until_blocking(target, false)
    }

    /// Wait until `target` is reached and its callback has returned
    pub async fn wait_for_phase_and_callback(&self, target: Phase) -> Result<Phase> {
        self.wait_until(target, true).await
    }

    pub fn wait_for_phase_and_callback_blocking(&self, target: Phase) -> Result<Phase> {
        self.wait_until_blocking(target, true)
    }

    /// Cancel an operation that has not reached the transport yet
    ///
    /// Returns true if this call moved the completion to `Failed`, in which
    /// case the request never ran. Returns false once the request was handed
    /// to the transport, or if the completion is terminal or released.
    pub fn cancel(&self) -> bool {
        let mut abort = None;
        let cancelled = self.transition(State::Failed(Failure::Cancelled), true, |inner| {
            inner.return_value = errno::ECANCELED;
            abort = inner.abort.take();
        });
        if let Some(handle) = abort {
            handle.abort();
        }
        if cancelled {
            debug!("completion {} cancelled", self.id());
        }
        cancelled
    }

    /// Release the completion's results and callbacks
    ///
    /// Allowed once the completion is terminal or if it was never submitted.
    pub fn release(&self) -> Result<()> {
        let mut inner = self.live()?;
        if inner.bound && !inner.state.phase().is_terminal() {
            return Err(AioError::StillPending(self.id()));
        }
        inner.released = true;
        inner.results = None;
        for slot in inner.slots.iter_mut() {
            if matches!(slot, Slot::Registered(_)) {
                *slot = Slot::Empty;
            }
        }
        inner.abort = None;
        drop(inner);

        self.notify();
        debug!("completion {} released", self.id());
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Per-sub-operation results of a terminal completion
    pub fn results(&self) -> Result<Vec<SubOpResult>> {
        let inner = self.live()?;
        if !inner.state.phase().is_terminal() {
            return Err(AioError::StillPending(self.id()));
        }
        match (&inner.results, &inner.state) {
            (Some(results), _) => Ok(results.clone()),
            (None, State::Failed(failure)) => Err(failure.clone().into()),
            (None, _) => Ok(Vec::new()),
        }
    }

    /// Overall return value: the acknowledged result, or a negative errno
    pub fn return_value(&self) -> Result<i32> {
        Ok(self.live()?.return_value)
    }

    /// Object version reported by the store
    pub fn version(&self) -> Result<u64> {
        Ok(self.live()?.version)
    }

    pub fn failure(&self) -> Result<Option<Failure>> {
        Ok(self.live()?.failure())
    }
}
