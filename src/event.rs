//! Opcodes, event identifiers and the fixed HCI header layouts the engine
//! understands.
//!
//! The engine is payload-agnostic: beyond the event header and the two
//! reserved synchronous completion layouts, frame contents pass through
//! untouched.

/// A 16-bit command opcode (OGF/OCF packed, as on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Opcode(u16);

impl Opcode {
    pub const fn new(raw: u16) -> Self {
        Opcode(raw)
    }

    pub const fn to_raw(self) -> u16 {
        self.0
    }

    pub(crate) fn from_le_bytes(lo: u8, hi: u8) -> Self {
        Opcode(u16::from_le_bytes([lo, hi]))
    }
}

/// An 8-bit event code, the first byte of an event frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventCode(u8);

impl EventCode {
    /// Command Complete. Reserved for the multiplexer's own routing.
    pub const COMMAND_COMPLETE: EventCode = EventCode(0x0e);
    /// Command Status. Reserved for the multiplexer's own routing.
    pub const COMMAND_STATUS: EventCode = EventCode(0x0f);
    /// LE Meta. Only its subevent namespace is registrable.
    pub const LE_META: EventCode = EventCode(0x3e);

    pub const fn new(raw: u8) -> Self {
        EventCode(raw)
    }

    pub const fn to_raw(self) -> u8 {
        self.0
    }

    /// Whether this outer code is one of the three codes the multiplexer
    /// routes itself and refuses external registrations for.
    pub const fn is_reserved(self) -> bool {
        matches!(
            self,
            EventCode::COMMAND_COMPLETE | EventCode::COMMAND_STATUS | EventCode::LE_META
        )
    }
}

/// An 8-bit subevent code inside the LE Meta event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubeventCode(u8);

impl SubeventCode {
    pub const fn new(raw: u8) -> Self {
        SubeventCode(raw)
    }

    pub const fn to_raw(self) -> u8 {
        self.0
    }
}

/// One identifier across the two event namespaces: plain event codes, and
/// subevent codes nested inside the LE Meta event.
///
/// The same numeric value in the two namespaces names two different events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventId {
    Plain(EventCode),
    MetaSub(SubeventCode),
}

impl EventId {
    /// The reserved outer codes cannot be registration targets. Subevents are
    /// always registrable.
    pub(crate) fn is_reserved(self) -> bool {
        match self {
            EventId::Plain(code) => code.is_reserved(),
            EventId::MetaSub(_) => false,
        }
    }
}

/// How a command signals its result.
///
/// `Sync` commands resolve on the Command Complete / Command Status pair
/// matching their opcode. `Async` commands get a Command Status first and
/// resolve later, when the named event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    Sync,
    Async(EventId),
}

/// An HCI status code carried in completion frames.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(u8);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    /// "Unspecified Error", used for every synthesized failure completion.
    pub const UNSPECIFIED: Status = Status(0x1f);

    pub const fn new(raw: u8) -> Self {
        Status(raw)
    }

    pub const fn to_raw(self) -> u8 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Status({:#04x})", self.0)
    }
}

/// Why an incoming frame was rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Shorter than the two-byte event header, or truncated parameters.
    TooShort,
    /// Reserved completion frame with parameters too short for its layout.
    BadCompletion,
}

/// A classified view of one incoming event frame.
#[derive(Debug)]
pub(crate) enum FrameKind<'a> {
    /// Command Complete: `[num_hci_cmd_pkts, opcode_le, status, ret...]`.
    CommandComplete {
        credit: u8,
        opcode: Opcode,
        status: Status,
        /// Return parameters following the status byte.
        ret: &'a [u8],
    },
    /// Command Status: `[status, num_hci_cmd_pkts, opcode_le]`.
    CommandStatus {
        credit: u8,
        opcode: Opcode,
        status: Status,
    },
    /// Anything else, keyed by outer code or LE Meta subevent.
    Event { id: EventId },
}

/// Classify a whole event frame (`[code, len, params...]`).
pub(crate) fn classify(frame: &[u8]) -> Result<FrameKind<'_>, FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::TooShort);
    }
    let code = EventCode::new(frame[0]);
    let len = usize::from(frame[1]);
    if frame.len() < 2 + len {
        return Err(FrameError::TooShort);
    }
    let params = &frame[2..2 + len];

    match code {
        EventCode::COMMAND_COMPLETE => {
            if params.len() < 3 {
                return Err(FrameError::BadCompletion);
            }
            // Commands without return parameters omit the status byte.
            let status = params.get(3).copied().map_or(Status::SUCCESS, Status::new);
            Ok(FrameKind::CommandComplete {
                credit: params[0],
                opcode: Opcode::from_le_bytes(params[1], params[2]),
                status,
                ret: if params.len() > 4 { &params[4..] } else { &[] },
            })
        }
        EventCode::COMMAND_STATUS => {
            if params.len() < 4 {
                return Err(FrameError::BadCompletion);
            }
            Ok(FrameKind::CommandStatus {
                status: Status::new(params[0]),
                credit: params[1],
                opcode: Opcode::from_le_bytes(params[2], params[3]),
            })
        }
        EventCode::LE_META => {
            if params.is_empty() {
                return Err(FrameError::BadCompletion);
            }
            Ok(FrameKind::Event {
                id: EventId::MetaSub(SubeventCode::new(params[0])),
            })
        }
        code => Ok(FrameKind::Event {
            id: EventId::Plain(code),
        }),
    }
}
