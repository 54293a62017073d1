//! Error types for the multiplexer's caller-facing operations.
//!
//! Protocol violations on the wire are absorbed and logged, never surfaced
//! here; these types cover only the conditions reported synchronously to the
//! caller, plus the channel-level failures delivered through the error hook.

use crate::event::Opcode;
use crate::transaction::CommandId;

/// Why `submit` refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitError {
    /// The channel is shutting down or closed.
    NotReady,
    /// The command frame is shorter than its own header says.
    InvalidFrame,
    /// The asynchronous completion names one of the reserved outer codes.
    ReservedEvent,
    /// A standing handler already claims the completion event, so the
    /// controller's event could not be demultiplexed to this command.
    EventClaimed,
}

/// Why `register_event` refused a standing registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    /// The channel is shutting down or closed.
    NotReady,
    /// The identifier is one of the reserved outer codes.
    Reserved,
    /// Another registration already claims the identifier.
    Occupied,
}

/// Channel-level failures reported through the error hook, distinct from
/// individual command completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// A sent command saw no completion within its timeout. The transaction
    /// stays pending so a late response still matches; treat repeated
    /// timeouts as transport loss.
    CommandTimeout { id: CommandId, opcode: Opcode },
}
