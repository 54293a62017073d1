//! Per-command bookkeeping from submission to terminal result.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::num::NonZeroU32;

use embassy_time::Instant;

use crate::event::{Completion, Opcode, Status};
use crate::registry::HandlerId;

/// Opaque identity of one submitted command, unique for the multiplexer's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandId(pub(crate) NonZeroU32);

/// Terminal result of one submitted command, delivered to its callback
/// exactly once.
///
/// For `Completion::Sync` commands `params` holds the return parameters
/// following the status byte. For `Completion::Async` commands it holds the
/// entire completing event frame. Synthesized failures (shutdown, destructor
/// safety net) carry `Status::UNSPECIFIED` and empty `params`.
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: Status,
    pub params: Vec<u8>,
}

impl CommandOutcome {
    pub(crate) fn failure() -> Self {
        CommandOutcome {
            status: Status::UNSPECIFIED,
            params: Vec::new(),
        }
    }
}

pub(crate) type CommandCallback = Box<dyn FnOnce(CommandOutcome)>;

/// Bookkeeping for one queued or in-flight command.
///
/// Dropping a transaction whose callback was never consumed synthesizes a
/// generic failure completion, so no caller is left waiting forever. That is
/// best-effort cleanup, not a substitute for explicit completion.
pub(crate) struct Transaction {
    id: CommandId,
    opcode: Opcode,
    completion: Completion,
    /// Opcodes that must not be pending while this one is. Always contains
    /// `opcode` itself.
    exclusions: Vec<Opcode>,
    callback: Option<CommandCallback>,
    /// Registry entry owned by this transaction, allocated when sent.
    handler: Option<HandlerId>,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl Transaction {
    pub fn new(
        id: CommandId,
        opcode: Opcode,
        completion: Completion,
        exclusions: &[Opcode],
        callback: CommandCallback,
    ) -> Self {
        let mut exclusions: Vec<Opcode> = exclusions.into();
        if !exclusions.contains(&opcode) {
            exclusions.push(opcode);
        }
        Transaction {
            id,
            opcode,
            completion,
            exclusions,
            callback: Some(callback),
            handler: None,
            deadline: None,
            timed_out: false,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn excludes(&self, opcode: Opcode) -> bool {
        self.exclusions.contains(&opcode)
    }

    pub fn handler(&self) -> Option<HandlerId> {
        self.handler
    }

    pub fn set_handler(&mut self, id: HandlerId) {
        self.handler = Some(id);
    }

    pub fn take_handler(&mut self) -> Option<HandlerId> {
        self.handler.take()
    }

    /// Arm the one-shot timeout. Arming twice is an API contract violation.
    pub fn arm(&mut self, deadline: Instant) {
        assert!(self.deadline.is_none(), "transaction timer armed twice");
        self.deadline = Some(deadline);
    }

    /// The armed deadline, if the timeout has not fired yet.
    pub fn deadline(&self) -> Option<Instant> {
        if self.timed_out {
            None
        } else {
            self.deadline
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }

    /// Consume the callback for delivery, disarming the timer. Returns `None`
    /// if the result was already delivered.
    pub fn take_callback(&mut self) -> Option<CommandCallback> {
        self.deadline = None;
        self.callback.take()
    }

    /// Drop the callback without invoking it. Used when the caller withdraws
    /// a still-queued command.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.callback = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(
                "transaction {} (opcode {:?}) dropped unresolved, synthesizing failure",
                self.id.0.get(),
                self.opcode
            );
            callback(CommandOutcome::failure());
        }
    }
}
