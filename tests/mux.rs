use std::cell::RefCell;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::rc::Rc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, MockDriver};
use futures_executor::LocalPool;
use futures_task::LocalSpawn;
use hci_mux::{
    ChannelError, ChannelMux, CommandOutcome, Completion, Config, EventCode, EventId, Opcode,
    RegisterError, Status, SubeventCode, SubmitError, Transport,
};

type FrameQueue = Channel<CriticalSectionRawMutex, Vec<u8>, 8>;

/// Loopback wire: records written command packets, feeds canned event
/// frames to `read_frame`.
#[derive(Clone)]
struct MockTransport {
    written: Rc<RefCell<Vec<Vec<u8>>>>,
    incoming: Rc<FrameQueue>,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport {
            written: Rc::new(RefCell::new(Vec::new())),
            incoming: Rc::new(Channel::new()),
        }
    }
}

impl Transport for MockTransport {
    type Error = Infallible;

    fn write_frame(&self, frame: &[u8]) -> Result<(), Infallible> {
        self.written.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let frame = self.incoming.receive().await;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }
}

fn command(opcode: u16) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    vec![lo, hi, 0x00]
}

fn command_complete(credit: u8, opcode: u16, status: u8) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    vec![0x0e, 0x04, credit, lo, hi, status]
}

fn command_status(status: u8, credit: u8, opcode: u16) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    vec![0x0f, 0x04, status, credit, lo, hi]
}

fn le_meta(subevent: u8) -> Vec<u8> {
    vec![0x3e, 0x01, subevent]
}

fn plain_event(code: u8) -> Vec<u8> {
    vec![code, 0x00]
}

fn outcome_slot() -> (Rc<RefCell<Vec<CommandOutcome>>>, impl FnOnce(CommandOutcome) + 'static) {
    let slot = Rc::new(RefCell::new(Vec::new()));
    let sink = slot.clone();
    (slot, move |outcome| sink.borrow_mut().push(outcome))
}

fn mux_with_credit(credit: u8) -> (ChannelMux<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let config = Config {
        initial_credit: credit,
        ..Config::default()
    };
    (ChannelMux::new(transport.clone(), config), transport)
}

#[test]
fn test_disjoint_commands_sent_in_order_in_one_pass() {
    let (mux, wire) = mux_with_credit(2);
    let (_, cb_a) = outcome_slot();
    let (_, cb_b) = outcome_slot();

    mux.submit(&command(0x0c03), Completion::Sync, &[], cb_a).unwrap();
    mux.submit(&command(0x0c14), Completion::Sync, &[], cb_b).unwrap();

    let written = wire.written.borrow();
    assert_eq!(*written, vec![command(0x0c03), command(0x0c14)]);
}

#[test]
fn test_credit_gates_the_wire() {
    let (mux, wire) = mux_with_credit(0);
    let (_, cb) = outcome_slot();

    mux.submit(&command(0x0c03), Completion::Sync, &[], cb).unwrap();
    assert!(wire.written.borrow().is_empty());

    // Credit is taken from every completion frame, even an unmatched one.
    mux.on_frame(&command_complete(1, 0x9999, 0x00));
    assert_eq!(*wire.written.borrow(), vec![command(0x0c03)]);
}

#[test]
fn test_exclusion_holds_command_until_conflict_completes() {
    let (mux, wire) = mux_with_credit(3);
    let (slot_a, cb_a) = outcome_slot();
    let (_, cb_b) = outcome_slot();

    let subevent = EventId::MetaSub(SubeventCode::new(0x0a));
    mux.submit(&command(0x2005), Completion::Async(subevent), &[], cb_a)
        .unwrap();
    mux.submit(&command(0x2006), Completion::Sync, &[Opcode::new(0x2005)], cb_b)
        .unwrap();

    // A is on the wire; B waits on its exclusion set.
    assert_eq!(wire.written.borrow().len(), 1);

    // The interim Command Status for an async command resolves nothing.
    mux.on_frame(&command_status(0x00, 3, 0x2005));
    assert_eq!(wire.written.borrow().len(), 1);
    assert!(slot_a.borrow().is_empty());

    // The matching subevent completes A, and B goes out in the same pass.
    mux.on_frame(&le_meta(0x0a));
    assert_eq!(*wire.written.borrow(), vec![command(0x2005), command(0x2006)]);

    let outcomes = slot_a.borrow();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].status.is_success());
    assert_eq!(outcomes[0].params, le_meta(0x0a));
}

#[test]
fn test_blocked_command_does_not_hold_up_later_ones() {
    let (mux, wire) = mux_with_credit(3);
    let (_, cb_a) = outcome_slot();
    let (slot_b, cb_b) = outcome_slot();
    let (_, cb_c) = outcome_slot();

    mux.submit(&command(0x0c03), Completion::Sync, &[], cb_a).unwrap();
    mux.submit(&command(0x0c14), Completion::Sync, &[Opcode::new(0x0c03)], cb_b)
        .unwrap();
    mux.submit(&command(0x1001), Completion::Sync, &[], cb_c).unwrap();

    // B is held by its exclusion set; the scheduler walks past it and sends C.
    assert_eq!(*wire.written.borrow(), vec![command(0x0c03), command(0x1001)]);

    mux.on_frame(&command_complete(3, 0x0c03, 0x00));
    assert_eq!(
        *wire.written.borrow(),
        vec![command(0x0c03), command(0x1001), command(0x0c14)]
    );

    mux.on_frame(&command_complete(3, 0x0c14, 0x00));
    assert_eq!(slot_b.borrow().len(), 1);
}

#[test]
fn test_same_opcode_is_never_pending_twice() {
    let (mux, wire) = mux_with_credit(5);
    let (_, cb_a) = outcome_slot();
    let (_, cb_b) = outcome_slot();

    mux.submit(&command(0x0c03), Completion::Sync, &[], cb_a).unwrap();
    mux.submit(&command(0x0c03), Completion::Sync, &[], cb_b).unwrap();
    assert_eq!(wire.written.borrow().len(), 1);

    mux.on_frame(&command_complete(5, 0x0c03, 0x00));
    assert_eq!(wire.written.borrow().len(), 2);
}

#[test]
fn test_standing_claim_blocks_submit_until_unregistered() {
    let (mux, wire) = mux_with_credit(1);
    let event = EventId::Plain(EventCode::new(0x05));

    let handler = mux.register_event(event, |_| ControlFlow::Continue(())).unwrap();

    let (_, cb) = outcome_slot();
    assert_eq!(
        mux.submit(&command(0x0406), Completion::Async(event), &[], cb),
        Err(SubmitError::EventClaimed)
    );

    mux.unregister_event(handler);
    let (_, cb) = outcome_slot();
    mux.submit(&command(0x0406), Completion::Async(event), &[], cb).unwrap();
    assert_eq!(*wire.written.borrow(), vec![command(0x0406)]);
}

#[test]
fn test_shared_completion_event_serializes_commands() {
    let (mux, wire) = mux_with_credit(5);
    let event = EventId::MetaSub(SubeventCode::new(0x01));
    let (slot_a, cb_a) = outcome_slot();
    let (slot_b, cb_b) = outcome_slot();

    mux.submit(&command(0x2005), Completion::Async(event), &[], cb_a)
        .unwrap();
    mux.submit(&command(0x2016), Completion::Async(event), &[], cb_b)
        .unwrap();

    // B waits: the subevent cannot be demultiplexed to two waiters.
    assert_eq!(wire.written.borrow().len(), 1);

    mux.on_frame(&le_meta(0x01));
    assert_eq!(wire.written.borrow().len(), 2);
    assert_eq!(slot_a.borrow().len(), 1);
    assert!(slot_b.borrow().is_empty());

    mux.on_frame(&le_meta(0x01));
    assert_eq!(slot_b.borrow().len(), 1);
}

#[test]
fn test_failed_status_tears_down_async_claim() {
    let (mux, wire) = mux_with_credit(5);
    let event = EventId::MetaSub(SubeventCode::new(0x02));
    let (slot, cb) = outcome_slot();

    mux.submit(&command(0x2043), Completion::Async(event), &[], cb)
        .unwrap();
    mux.on_frame(&command_status(0x0c, 5, 0x2043));

    let outcomes = slot.borrow();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, Status::new(0x0c));

    // The identifier is free again for a standing registration.
    drop(outcomes);
    assert!(mux.register_event(event, |_| ControlFlow::Continue(())).is_ok());
    let _ = wire;
}

#[test]
fn test_standing_handler_can_remove_itself() {
    let (mux, _wire) = mux_with_credit(1);
    let event = EventId::Plain(EventCode::new(0x10));
    let seen = Rc::new(RefCell::new(0u32));

    let sink = seen.clone();
    mux.register_event(event, move |_| {
        *sink.borrow_mut() += 1;
        ControlFlow::Break(())
    })
    .unwrap();

    mux.on_frame(&plain_event(0x10));
    mux.on_frame(&plain_event(0x10));
    assert_eq!(*seen.borrow(), 1);
}

#[test]
fn test_reserved_identifiers_are_rejected() {
    let (mux, _wire) = mux_with_credit(1);
    for code in [0x0e, 0x0f, 0x3e] {
        assert_eq!(
            mux.register_event(EventId::Plain(EventCode::new(code)), |_| ControlFlow::Continue(())),
            Err(RegisterError::Reserved)
        );
    }
    // The subevent namespace inside LE Meta stays registrable.
    assert!(mux
        .register_event(EventId::MetaSub(SubeventCode::new(0x3e)), |_| ControlFlow::Continue(()))
        .is_ok());
}

#[test]
fn test_cancel_withdraws_only_queued_commands() {
    let (mux, wire) = mux_with_credit(1);
    let (slot_a, cb_a) = outcome_slot();
    let (slot_b, cb_b) = outcome_slot();

    let sent = mux.submit(&command(0x0c03), Completion::Sync, &[], cb_a).unwrap();
    let queued = mux.submit(&command(0x0c14), Completion::Sync, &[], cb_b).unwrap();
    assert_eq!(wire.written.borrow().len(), 1);

    // Already on the wire: not cancellable.
    assert!(!mux.cancel(sent));
    // Still queued: withdrawn, callback dropped uninvoked.
    assert!(mux.cancel(queued));
    assert!(!mux.cancel(queued));

    mux.on_frame(&command_complete(1, 0x0c03, 0x00));
    assert_eq!(slot_a.borrow().len(), 1);
    assert!(slot_b.borrow().is_empty());
    assert_eq!(wire.written.borrow().len(), 1);
}

#[test]
fn test_shutdown_resolves_everything_exactly_once() {
    let (mux, wire) = mux_with_credit(1);
    let (slot_a, cb_a) = outcome_slot();
    let (slot_b, cb_b) = outcome_slot();

    mux.submit(&command(0x0c03), Completion::Sync, &[], cb_a).unwrap();
    mux.submit(&command(0x0c14), Completion::Sync, &[], cb_b).unwrap();
    assert_eq!(wire.written.borrow().len(), 1);

    mux.shutdown();

    let a = slot_a.borrow();
    let b = slot_b.borrow();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].status, Status::UNSPECIFIED);
    assert_eq!(b[0].status, Status::UNSPECIFIED);
    drop((a, b));

    let (_, cb) = outcome_slot();
    assert_eq!(
        mux.submit(&command(0x0c03), Completion::Sync, &[], cb),
        Err(SubmitError::NotReady)
    );

    // Idempotent: no second synthetic completion.
    mux.shutdown();
    assert_eq!(slot_a.borrow().len(), 1);
}

#[test]
fn test_completion_callback_may_resubmit() {
    let (mux, wire) = mux_with_credit(2);
    let mux = Rc::new(mux);

    let resubmit = mux.clone();
    mux.submit(&command(0x0c03), Completion::Sync, &[], move |outcome| {
        assert!(outcome.status.is_success());
        let (_, cb) = outcome_slot();
        resubmit.submit(&command(0x0c14), Completion::Sync, &[], cb).unwrap();
    })
    .unwrap();

    mux.on_frame(&command_complete(2, 0x0c03, 0x00));
    assert_eq!(*wire.written.borrow(), vec![command(0x0c03), command(0x0c14)]);
}

#[test]
fn test_timeout_fires_once_and_late_frame_still_matches() {
    let mut executor = LocalPool::new();
    let spawner = executor.spawner();
    let time = MockDriver::get();

    let (mux, wire) = mux_with_credit(1);
    let mux: &'static ChannelMux<MockTransport> = Box::leak(Box::new(mux));

    let errors: &'static RefCell<Vec<ChannelError>> = Box::leak(Box::new(RefCell::new(Vec::new())));
    mux.set_error_hook(|err| errors.borrow_mut().push(err));

    let (slot, cb) = outcome_slot();
    let id = mux.submit(&command(0x0c03), Completion::Sync, &[], cb).unwrap();
    assert_eq!(wire.written.borrow().len(), 1);

    spawner
        .spawn_local_obj(
            Box::new(async move {
                mux.run().await.unwrap();
            })
            .into(),
        )
        .unwrap();
    executor.run_until_stalled();

    // Past the default command timeout: the hook fires, once.
    time.advance(Duration::from_secs(11));
    executor.run_until_stalled();
    assert_eq!(
        *errors.borrow(),
        vec![ChannelError::CommandTimeout {
            id,
            opcode: Opcode::new(0x0c03)
        }]
    );
    assert!(slot.borrow().is_empty());

    time.advance(Duration::from_secs(11));
    executor.run_until_stalled();
    assert_eq!(errors.borrow().len(), 1);

    // The late response still matches and completes the transaction.
    wire.incoming.try_send(command_complete(1, 0x0c03, 0x00)).unwrap();
    executor.run_until_stalled();
    let outcomes = slot.borrow();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].status.is_success());

    mux.shutdown();
    executor.run_until_stalled();
}
