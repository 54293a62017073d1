//! The control-channel multiplexer: send queue, scheduler, pending table and
//! frame dispatch.
//!
//! All state lives in one `RefCell` and is touched from a single logical
//! execution context; the type is `!Sync` and needs no locks. The only
//! hazard is reentrancy: completion callbacks are queued while the state is
//! borrowed and invoked only after the borrow is released, so a callback
//! that re-enters `submit` or `shutdown` observes fully consistent state.
//! Standing handlers are likewise invoked with the borrow released, taken
//! out of the registry by id for the duration of the call.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::mem;
use core::num::NonZeroU32;
use core::ops::ControlFlow;

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::error::{ChannelError, RegisterError, SubmitError};
use crate::event::{classify, Completion, EventId, FrameKind, Opcode, Status};
use crate::registry::{EventHandler, EventRegistry, HandlerId, Ownership};
use crate::transaction::{CommandId, CommandOutcome, Transaction};
use crate::transport::{Transport, MAX_EVENT_FRAME_LEN};

/// Multiplexer tuning.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// One-shot timeout armed for every sent command.
    pub command_timeout: Duration,
    /// Commands the controller accepts before its first completion frame
    /// advertises the real credit.
    pub initial_credit: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            command_timeout: Duration::from_secs(10),
            initial_credit: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Lifecycle {
    Uninitialized,
    Ready,
    ShuttingDown,
    Closed,
}

/// An unsent command: its transaction plus the wire frame to write, owned
/// exclusively by the send queue until sent or cancelled.
struct QueuedCommand {
    transaction: Transaction,
    frame: Vec<u8>,
}

#[derive(Default)]
struct Metrics {
    malformed_frames: u32,
    unmatched_completions: u32,
    dropped_events: u32,
    timeouts: u32,
}

type ErrorHook = Box<dyn FnMut(ChannelError)>;

struct State {
    lifecycle: Lifecycle,
    config: Config,
    next_command_id: NonZeroU32,
    /// Controller-advertised outstanding-command credit.
    credit: u8,
    queue: VecDeque<QueuedCommand>,
    /// Sent commands awaiting completion, keyed by opcode.
    pending: BTreeMap<Opcode, Transaction>,
    registry: EventRegistry,
    /// Completions queued while the state is borrowed, delivered afterwards.
    deferred: Vec<(crate::transaction::CommandCallback, CommandOutcome)>,
    error_hook: Option<ErrorHook>,
    metrics: Metrics,
}

/// The channel multiplexer. Owns the transport, the send queue, the pending
/// table and the event registry; callers hold only opaque ids.
pub struct ChannelMux<T: Transport> {
    transport: T,
    state: RefCell<State>,
    /// Pokes `run` when the scheduler arms a new timeout or the channel
    /// closes, so the timer wakes on the right deadline.
    rearm: Signal<NoopRawMutex, ()>,
}

impl<T: Transport> ChannelMux<T> {
    /// Attach the transport and enter the `Ready` state.
    pub fn new(transport: T, config: Config) -> Self {
        let mut state = State {
            lifecycle: Lifecycle::Uninitialized,
            config,
            next_command_id: NonZeroU32::MIN,
            credit: config.initial_credit,
            queue: VecDeque::new(),
            pending: BTreeMap::new(),
            registry: EventRegistry::new(),
            deferred: Vec::new(),
            error_hook: None,
            metrics: Metrics::default(),
        };
        // Reads can start as soon as the transport is owned.
        state.lifecycle = Lifecycle::Ready;
        ChannelMux {
            transport,
            state: RefCell::new(state),
            rearm: Signal::new(),
        }
    }

    /// Install the channel-level error hook. Timeouts are reported here,
    /// distinct from individual command completions.
    pub fn set_error_hook(&self, hook: impl FnMut(ChannelError) + 'static) {
        self.state.borrow_mut().error_hook = Some(Box::new(hook));
    }

    /// Queue a serialized command packet (`[opcode_le, len, params...]`) and
    /// return immediately. The callback fires exactly once with the final
    /// result, on a later turn.
    pub fn submit(
        &self,
        frame: &[u8],
        completion: Completion,
        exclusions: &[Opcode],
        callback: impl FnOnce(CommandOutcome) + 'static,
    ) -> Result<CommandId, SubmitError> {
        let mut s = self.state.borrow_mut();
        if s.lifecycle != Lifecycle::Ready {
            return Err(SubmitError::NotReady);
        }
        if frame.len() < 3 || frame.len() < 3 + usize::from(frame[2]) {
            return Err(SubmitError::InvalidFrame);
        }
        let opcode = Opcode::from_le_bytes(frame[0], frame[1]);
        if let Completion::Async(event) = completion {
            if event.is_reserved() {
                return Err(SubmitError::ReservedEvent);
            }
            // A standing claim means the controller's event could never be
            // demultiplexed to this command. A transaction-owned claim only
            // delays scheduling.
            if let Some(entry) = s.registry.claimant(event) {
                if entry.ownership() == Ownership::Standing {
                    return Err(SubmitError::EventClaimed);
                }
            }
        }
        let id = CommandId(s.next_command_id);
        s.next_command_id = s.next_command_id.checked_add(1).unwrap_or(NonZeroU32::MIN);
        let transaction = Transaction::new(id, opcode, completion, exclusions, Box::new(callback));
        s.queue.push_back(QueuedCommand {
            transaction,
            frame: frame.to_vec(),
        });
        self.try_send_queued(&mut s);
        Ok(id)
    }

    /// Register a standing handler for an event or subevent identifier.
    ///
    /// The three reserved outer codes are refused, as is an identifier that
    /// already has a claim. The handler receives each whole matching frame;
    /// returning `ControlFlow::Break(())` removes the registration.
    pub fn register_event(
        &self,
        event: EventId,
        handler: impl FnMut(&[u8]) -> ControlFlow<()> + 'static,
    ) -> Result<HandlerId, RegisterError> {
        let mut s = self.state.borrow_mut();
        if s.lifecycle != Lifecycle::Ready {
            return Err(RegisterError::NotReady);
        }
        if event.is_reserved() {
            return Err(RegisterError::Reserved);
        }
        s.registry.register_standing(event, Box::new(handler))
    }

    /// Remove a standing registration. Transaction-owned registrations are
    /// ignored; only completion removes those.
    pub fn unregister_event(&self, id: HandlerId) {
        let mut s = self.state.borrow_mut();
        match s.registry.ownership(id) {
            Some(Ownership::Standing) => {
                s.registry.remove(id);
                // A queued command waiting on this identifier may be
                // sendable now.
                self.try_send_queued(&mut s);
            }
            Some(Ownership::Owned(_)) => {
                debug!("ignoring unregister of transaction-owned handler {:?}", id)
            }
            None => {}
        }
    }

    /// Withdraw a still-queued command. Returns `false` once the command has
    /// been written to the wire (or never existed); then only natural
    /// completion or timeout applies.
    pub fn cancel(&self, id: CommandId) -> bool {
        let mut s = self.state.borrow_mut();
        let Some(pos) = s.queue.iter().position(|qc| qc.transaction.id() == id) else {
            return false;
        };
        let Some(mut qc) = s.queue.remove(pos) else {
            return false;
        };
        if let Some(hid) = qc.transaction.take_handler() {
            s.registry.remove(hid);
        }
        qc.transaction.cancel();
        true
    }

    /// Resolve every queued and pending command with a synthetic failure,
    /// clear the registry and close the channel. Idempotent.
    pub fn shutdown(&self) {
        let (queue, pending) = {
            let mut s = self.state.borrow_mut();
            if matches!(s.lifecycle, Lifecycle::ShuttingDown | Lifecycle::Closed) {
                return;
            }
            s.lifecycle = Lifecycle::ShuttingDown;
            let queue = mem::take(&mut s.queue);
            let pending = mem::take(&mut s.pending);
            s.registry.clear();
            s.lifecycle = Lifecycle::Closed;
            (queue, pending)
        };
        self.rearm.signal(());
        // Dropped outside the borrow: each destructor safety net fires a
        // generic failure, and resolved callers may re-enter freely.
        drop(queue);
        drop(pending);
    }

    /// Sole ingress point for received event frames.
    pub fn on_frame(&self, frame: &[u8]) {
        let mut standing: Option<(HandlerId, EventHandler)> = None;
        {
            let mut s = self.state.borrow_mut();
            if s.lifecycle != Lifecycle::Ready {
                trace!("dropping frame received while closed");
                return;
            }
            match classify(frame) {
                Err(e) => {
                    warn!("dropping malformed frame: {:?}", e);
                    s.metrics.malformed_frames += 1;
                    return;
                }
                Ok(FrameKind::CommandComplete {
                    credit,
                    opcode,
                    status,
                    ret,
                }) => self.on_completion(&mut s, opcode, credit, status, ret, true),
                Ok(FrameKind::CommandStatus {
                    credit,
                    opcode,
                    status,
                }) => self.on_completion(&mut s, opcode, credit, status, &[], false),
                Ok(FrameKind::Event { id }) => standing = self.on_event(&mut s, id, frame),
            }
            if standing.is_none() {
                self.try_send_queued(&mut s);
            }
        }
        if let Some((id, mut handler)) = standing {
            let flow = handler(frame);
            let mut s = self.state.borrow_mut();
            match flow {
                ControlFlow::Continue(()) => s.registry.restore_handler(id, handler),
                ControlFlow::Break(()) => {
                    s.registry.remove(id);
                }
            }
            // The handler may have freed an identifier a queued command
            // was waiting for.
            self.try_send_queued(&mut s);
        }
        self.drain_deferred();
    }

    /// Command Complete / Command Status handling. Both update the credit
    /// unconditionally; whether the matching transaction resolves depends on
    /// its declared completion kind.
    fn on_completion(
        &self,
        s: &mut State,
        opcode: Opcode,
        credit: u8,
        status: Status,
        ret: &[u8],
        is_complete: bool,
    ) {
        s.credit = credit;
        let completion = match s.pending.get(&opcode) {
            Some(tx) => tx.completion(),
            None => {
                // Protocol violation by the controller; non-fatal.
                warn!("completion for opcode {:?} with no pending command", opcode);
                s.metrics.unmatched_completions += 1;
                return;
            }
        };
        let resolve = match completion {
            Completion::Sync => true,
            // A successful Command Status is the normal interim answer for
            // an asynchronous command; the real event is still to come.
            Completion::Async(_) if !is_complete => !status.is_success(),
            Completion::Async(_) => {
                warn!(
                    "async command {:?} resolved via Command Complete, tearing down its event claim",
                    opcode
                );
                true
            }
        };
        if !resolve {
            return;
        }
        if let Some(mut tx) = s.pending.remove(&opcode) {
            if tx.timed_out() {
                debug!("late completion for timed-out command {:?}", opcode);
            }
            if let Some(hid) = tx.take_handler() {
                s.registry.remove(hid);
            }
            if let Some(callback) = tx.take_callback() {
                s.deferred.push((
                    callback,
                    CommandOutcome {
                        status,
                        params: ret.to_vec(),
                    },
                ));
            }
        }
    }

    /// Event dispatch. Owned registrations complete their transaction and
    /// vanish; standing handlers are returned to the caller to be invoked
    /// once the state borrow is released.
    fn on_event(&self, s: &mut State, id: EventId, frame: &[u8]) -> Option<(HandlerId, EventHandler)> {
        let Some(hid) = s.registry.handler_for(id) else {
            debug!("dropping event {:?} with no registration", id);
            s.metrics.dropped_events += 1;
            return None;
        };
        match s.registry.ownership(hid) {
            Some(Ownership::Owned(opcode)) => {
                s.registry.remove(hid);
                match s.pending.remove(&opcode) {
                    Some(mut tx) => {
                        tx.take_handler();
                        if let Some(callback) = tx.take_callback() {
                            s.deferred.push((
                                callback,
                                CommandOutcome {
                                    status: Status::SUCCESS,
                                    params: frame.to_vec(),
                                },
                            ));
                        }
                    }
                    None => warn!("owned registration for {:?} had no pending transaction", id),
                }
                None
            }
            Some(Ownership::Standing) => match s.registry.take_handler(hid) {
                Some(handler) => Some((hid, handler)),
                None => {
                    warn!("standing handler for {:?} is already running, frame dropped", id);
                    None
                }
            },
            None => None,
        }
    }

    /// One scheduling pass: walk the queue in FIFO order and write every
    /// command whose exclusion set and completion identifier are free,
    /// until the credit runs out.
    fn try_send_queued(&self, s: &mut State) {
        if s.lifecycle != Lifecycle::Ready {
            return;
        }
        let mut idx = 0;
        while idx < s.queue.len() {
            if s.credit == 0 {
                break;
            }
            let qc = &s.queue[idx];
            if s.pending.keys().any(|op| qc.transaction.excludes(*op)) {
                idx += 1;
                continue;
            }
            if let Completion::Async(event) = qc.transaction.completion() {
                // The controller's event cannot be demultiplexed to two
                // waiters; wait until the identifier is vacated.
                if s.registry.claimant(event).is_some() {
                    idx += 1;
                    continue;
                }
            }
            if let Err(e) = self.transport.write_frame(&s.queue[idx].frame) {
                warn!("wire write failed, command stays queued: {:?}", e);
                break;
            }
            let Some(mut qc) = s.queue.remove(idx) else {
                break;
            };
            s.credit -= 1;
            let deadline = Instant::now() + s.config.command_timeout;
            qc.transaction.arm(deadline);
            if let Completion::Async(event) = qc.transaction.completion() {
                if qc.transaction.handler().is_none() {
                    match s.registry.register_owned(event, qc.transaction.opcode()) {
                        Ok(hid) => qc.transaction.set_handler(hid),
                        // The claim was checked free just above.
                        Err(_) => unreachable!(),
                    }
                }
            }
            debug_assert!(!s.pending.contains_key(&qc.transaction.opcode()));
            s.pending.insert(qc.transaction.opcode(), qc.transaction);
            self.rearm.signal(());
        }
    }

    /// Deliver completions queued during dispatch. Runs with the state
    /// borrow released; callbacks may re-enter the multiplexer.
    fn drain_deferred(&self) {
        loop {
            let batch = {
                let mut s = self.state.borrow_mut();
                if s.deferred.is_empty() {
                    break;
                }
                mem::take(&mut s.deferred)
            };
            for (callback, outcome) in batch {
                callback(outcome);
            }
        }
    }

    /// Fire the error hook for every pending command whose deadline has
    /// passed. The transactions stay pending: a late response must still be
    /// matched and consumed rather than misattributed.
    fn process_timeouts(&self) {
        let now = Instant::now();
        let (hook, expired) = {
            let mut s = self.state.borrow_mut();
            let State {
                pending, metrics, ..
            } = &mut *s;
            let mut expired: Vec<ChannelError> = Vec::new();
            for tx in pending.values_mut() {
                if tx.deadline().is_some_and(|deadline| deadline <= now) {
                    tx.mark_timed_out();
                    metrics.timeouts += 1;
                    warn!("command {:?} timed out", tx.opcode());
                    expired.push(ChannelError::CommandTimeout {
                        id: tx.id(),
                        opcode: tx.opcode(),
                    });
                }
            }
            (s.error_hook.take(), expired)
        };
        if let Some(mut hook) = hook {
            for err in expired {
                hook(err);
            }
            let mut s = self.state.borrow_mut();
            // The hook may have replaced itself while it ran.
            if s.error_hook.is_none() {
                s.error_hook = Some(hook);
            }
        }
    }

    /// Drive the channel: read frames, fire timeouts, until the transport
    /// fails or the channel is shut down.
    pub async fn run(&self) -> Result<(), T::Error> {
        let mut buf = [0u8; MAX_EVENT_FRAME_LEN];
        loop {
            let deadline = {
                let s = self.state.borrow();
                if s.lifecycle == Lifecycle::Closed {
                    return Ok(());
                }
                s.pending
                    .values()
                    .filter_map(|tx| tx.deadline())
                    .min()
                    .unwrap_or(Instant::MAX)
            };
            match select3(
                self.transport.read_frame(&mut buf),
                Timer::at(deadline),
                self.rearm.wait(),
            )
            .await
            {
                Either3::First(Ok(len)) => self.on_frame(&buf[..len]),
                Either3::First(Err(e)) => return Err(e),
                Either3::Second(()) => self.process_timeouts(),
                // Deadlines changed; recompute.
                Either3::Third(()) => {}
            }
        }
    }

    /// Log queue, credit and violation counters.
    pub fn log_status(&self) {
        let s = self.state.borrow();
        debug!(
            "[mux] queued: {}, pending: {}, credit: {}",
            s.queue.len(),
            s.pending.len(),
            s.credit
        );
        debug!("[mux] malformed frames: {}", s.metrics.malformed_frames);
        debug!("[mux] unmatched completions: {}", s.metrics.unmatched_completions);
        debug!("[mux] dropped events: {}", s.metrics.dropped_events);
        debug!("[mux] command timeouts: {}", s.metrics.timeouts);
    }
}
