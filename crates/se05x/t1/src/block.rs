//! Block layout: node address, protocol control byte and length prologue
//!
//! ```text
//! | NAD | PCB | LEN (1 or 3) | INF (LEN bytes) | EDC (1 or 2) |
//! ```
//!
//! The PCB distinguishes three block types:
//!
//! - I-block `0b0NM0_0000`: information, N = N(S), M = more blocks follow
//! - R-block `0b100N_00EE`: receive ready, N = N(R), EE = error code
//! - S-block `0b11R0_0000 | code`: supervisory, R = response

use core::fmt;

/// Node address used by the host when addressing the secure element
pub const NAD_HOST_TO_SE: u8 = 0x5A;

/// Node address used by the secure element when answering the host
pub const NAD_SE_TO_HOST: u8 = 0xA5;

/// Largest payload a single LEN byte describes
pub const SHORT_LEN_MAX: usize = 0xFE;

/// LEN value announcing a big-endian two byte length
pub const EXTENDED_LEN_MARKER: u8 = 0xFF;

/// Largest payload any block can carry
pub const MAX_BLOCK_PAYLOAD: usize = u16::MAX as usize;

const PCB_R_BLOCK: u8 = 0x80;
const PCB_S_BLOCK: u8 = 0xC0;
const PCB_TYPE_MASK: u8 = 0xC0;
const PCB_I_SEQ: u8 = 0x40;
const PCB_I_MORE: u8 = 0x20;
const PCB_I_RFU: u8 = 0x1F;
const PCB_R_SEQ: u8 = 0x10;
const PCB_R_ERROR: u8 = 0x03;
const PCB_R_RFU: u8 = 0x2C;
const PCB_S_RESPONSE: u8 = 0x20;
const PCB_S_CODE: u8 = 0x1F;

/// One-bit block sequence number, N(S) for I-blocks and N(R) for R-blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(bool);

impl Seq {
    /// Sequence number 0, used after open and resynchronisation
    pub const ZERO: Self = Self(false);
    /// Sequence number 1
    pub const ONE: Self = Self(true);

    /// The sequence number that follows this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(!self.0)
    }

    /// The sequence number as `0` or `1`
    pub const fn bit(self) -> u8 {
        self.0 as u8
    }

    const fn from_flag(pcb: u8, mask: u8) -> Self {
        Self(pcb & mask != 0)
    }

    const fn flag(self, mask: u8) -> u8 {
        if self.0 { mask } else { 0 }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bit())
    }
}

/// Error code reported by an R-block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadyError {
    /// Plain acknowledgement
    #[default]
    None,
    /// The previous block failed its checksum
    Checksum,
    /// The previous block was invalid for another reason
    Other,
}

impl ReadyError {
    const fn code(self) -> u8 {
        match self {
            Self::None => 0b00,
            Self::Checksum => 0b01,
            Self::Other => 0b10,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0b00 => Some(Self::None),
            0b01 => Some(Self::Checksum),
            0b10 => Some(Self::Other),
            _ => None,
        }
    }
}

/// Supervisory block function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisoryKind {
    /// Reset both sequence numbers
    Resync,
    /// Information field size announcement
    Ifs,
    /// Abort a chain
    Abort,
    /// Wait time extension
    Wtx,
    /// Close the current APDU session
    EndApduSession,
    /// Reset the secure element
    ChipReset,
    /// Fetch the answer to reset
    GetAtr,
    /// Reset the communication interface, answered with the ATR
    SoftReset,
}

impl SupervisoryKind {
    /// The five-bit function code in the PCB
    pub const fn code(self) -> u8 {
        match self {
            Self::Resync => 0x00,
            Self::Ifs => 0x01,
            Self::Abort => 0x02,
            Self::Wtx => 0x03,
            Self::EndApduSession => 0x05,
            Self::ChipReset => 0x06,
            Self::GetAtr => 0x07,
            Self::SoftReset => 0x0F,
        }
    }

    /// Look up a function code
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Resync),
            0x01 => Some(Self::Ifs),
            0x02 => Some(Self::Abort),
            0x03 => Some(Self::Wtx),
            0x05 => Some(Self::EndApduSession),
            0x06 => Some(Self::ChipReset),
            0x07 => Some(Self::GetAtr),
            0x0F => Some(Self::SoftReset),
            _ => None,
        }
    }
}

/// Block type together with the control information the PCB carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// I-block carrying APDU bytes
    Information {
        /// N(S)
        seq: Seq,
        /// More blocks of the same chain follow
        more: bool,
    },
    /// R-block acknowledging a chained block or requesting a retransmission
    ReceiveReady {
        /// N(R), the sequence number of the I-block expected next
        seq: Seq,
        /// Error reported about the last received block
        error: ReadyError,
    },
    /// S-block controlling the link
    Supervisory {
        /// Function requested or answered
        kind: SupervisoryKind,
        /// Set on the answer to a request
        response: bool,
    },
}

impl BlockKind {
    /// Encode as a protocol control byte
    pub const fn pcb(self) -> u8 {
        match self {
            Self::Information { seq, more } => {
                seq.flag(PCB_I_SEQ) | if more { PCB_I_MORE } else { 0 }
            }
            Self::ReceiveReady { seq, error } => PCB_R_BLOCK | seq.flag(PCB_R_SEQ) | error.code(),
            Self::Supervisory { kind, response } => {
                PCB_S_BLOCK | if response { PCB_S_RESPONSE } else { 0 } | kind.code()
            }
        }
    }

    /// Decode a protocol control byte, `None` for an unknown block type
    pub const fn from_pcb(pcb: u8) -> Option<Self> {
        match pcb & PCB_TYPE_MASK {
            PCB_S_BLOCK => match SupervisoryKind::from_code(pcb & PCB_S_CODE) {
                Some(kind) => Some(Self::Supervisory {
                    kind,
                    response: pcb & PCB_S_RESPONSE != 0,
                }),
                None => None,
            },
            PCB_R_BLOCK => {
                if pcb & PCB_R_RFU != 0 {
                    return None;
                }
                match ReadyError::from_code(pcb & PCB_R_ERROR) {
                    Some(error) => Some(Self::ReceiveReady {
                        seq: Seq::from_flag(pcb, PCB_R_SEQ),
                        error,
                    }),
                    None => None,
                }
            }
            _ => {
                if pcb & PCB_I_RFU != 0 {
                    return None;
                }
                Some(Self::Information {
                    seq: Seq::from_flag(pcb, PCB_I_SEQ),
                    more: pcb & PCB_I_MORE != 0,
                })
            }
        }
    }

    /// Plain acknowledgement expecting `seq` next
    pub const fn ack(seq: Seq) -> Self {
        Self::ReceiveReady {
            seq,
            error: ReadyError::None,
        }
    }

    /// Supervisory request
    pub const fn request(kind: SupervisoryKind) -> Self {
        Self::Supervisory {
            kind,
            response: false,
        }
    }

    /// Supervisory response
    pub const fn response(kind: SupervisoryKind) -> Self {
        Self::Supervisory {
            kind,
            response: true,
        }
    }
}

/// One framed transport unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Node address
    pub node_address: u8,
    /// Block type and control flags
    pub kind: BlockKind,
    /// Information field
    pub payload: &'a [u8],
    /// Epilogue value over address, control, length and payload
    pub checksum: u16,
}

impl Block<'_> {
    /// Whether this is an I-block followed by more blocks of its chain
    pub const fn is_chained(&self) -> bool {
        matches!(self.kind, BlockKind::Information { more: true, .. })
    }

    /// N(S) of an I-block or N(R) of an R-block
    pub const fn seq(&self) -> Option<Seq> {
        match self.kind {
            BlockKind::Information { seq, .. } | BlockKind::ReceiveReady { seq, .. } => Some(seq),
            BlockKind::Supervisory { .. } => None,
        }
    }
}

/// Length of the prologue needed for a payload of `payload_len` bytes
pub const fn prologue_len(payload_len: usize) -> usize {
    if payload_len <= SHORT_LEN_MAX { 3 } else { 5 }
}
