//! # hci-mux
//!
//! A payload-agnostic command/event multiplexer for the HCI control channel
//! of a Bluetooth controller. It turns one byte-oriented wire into a
//! structured asynchronous protocol: commands go out serialized and
//! credit-gated, completions come back matched to the command that caused
//! them, and unsolicited events fan out to registered subscribers —
//! including the subevent namespace nested inside the LE Meta event.
//!
//! ## Architecture
//!
//! ```text
//!  submit / cancel            register_event / unregister_event
//!        │                                  │
//!        ▼                                  ▼
//!  ┌───────────┐   scheduler   ┌────────────────┐
//!  │ Send queue ├─────────────►│   ChannelMux   │◄── run() ── Transport
//!  └───────────┘               ├────────────────┤
//!                              │ pending table  │──► command callbacks
//!                              │ event registry │──► standing handlers
//!                              │ credit counter │
//!                              └────────────────┘
//! ```
//!
//! Each scheduling pass walks the send queue in FIFO order and writes every
//! command whose exclusion set has no pending opcode and whose completion
//! event is unclaimed, until the controller's advertised credit runs out.
//! The pass re-runs after every completion and every standing-handler
//! dispatch, so a freshly-freed exclusion unblocks the next command within
//! the same turn.
//!
//! The engine interprets nothing beyond the event header and the two
//! reserved completion layouts; individual command and event payloads pass
//! through untouched.
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative: `ChannelMux` is `!Sync` and lock-free, built
//! to live on one executor. `submit` and `register_event` never block.
//! Completion callbacks are never invoked while the multiplexer's state is
//! being updated — they are queued and delivered on a fresh turn, so a
//! callback may safely submit follow-up commands or shut the channel down.
//!
//! Shutting down resolves every queued and pending command with a generic
//! failure completion; no caller is left waiting on a closed channel.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod channel;
mod error;
mod event;
mod registry;
mod transaction;
mod transport;

pub use channel::{ChannelMux, Config};
pub use error::{ChannelError, RegisterError, SubmitError};
pub use event::{Completion, EventCode, EventId, FrameError, Opcode, Status, SubeventCode};
pub use registry::HandlerId;
pub use transaction::{CommandId, CommandOutcome};
pub use transport::{H4Error, H4Transport, Transport, MAX_EVENT_FRAME_LEN};
