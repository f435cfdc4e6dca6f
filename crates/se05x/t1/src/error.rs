//! Error types for the T=1 transport

use alloc::{boxed::Box, string::String};
use core::time::Duration;

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = core::result::Result<T, TransportError>;

/// Failure to decode or encode a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Epilogue does not match the block contents
    #[error("Checksum mismatch: expected {expected:#06X}, received {actual:#06X}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        expected: u16,
        /// Checksum carried in the epilogue
        actual: u16,
    },

    /// Block structure is invalid
    #[error("Malformed block: {0}")]
    Malformed(&'static str),

    /// Payload exceeds the negotiated block size
    #[error("Block payload of {len} bytes exceeds maximum of {max}")]
    Oversized {
        /// Payload length
        len: usize,
        /// Largest allowed payload
        max: usize,
    },

    /// Output buffer cannot hold the encoded block
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },
}

/// Invalid transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A timeout was configured as zero
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// Exchange timeout shorter than a single block wait
    #[error("Exchange timeout {exchange:?} is shorter than block timeout {block:?}")]
    ExchangeShorterThanBlock {
        /// Configured exchange timeout
        exchange: Duration,
        /// Configured block timeout
        block: Duration,
    },

    /// Maximum block payload outside the encodable range
    #[error("Block payload size {0} out of range 1..={max}", max = crate::block::MAX_BLOCK_PAYLOAD)]
    BlockPayloadOutOfRange(usize),

    /// Read buffer smaller than the protocol minimum
    #[error("Read buffer capacity {capacity} below minimum {minimum}")]
    ReadBufferTooSmall {
        /// Configured capacity
        capacity: usize,
        /// Smallest usable capacity
        minimum: usize,
    },

    /// Host and peer share a node address
    #[error("Node address {0:#04X} is used for both directions")]
    AddressCollision(u8),
}

/// Failure reported by a [`Link`](crate::Link) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No data within the allowed time
    #[error("Link timed out")]
    Timeout,

    /// Device did not acknowledge its address
    #[error("Device did not acknowledge")]
    Nack,

    /// Link is not open
    #[error("Link is closed")]
    Closed,

    /// Fewer bytes were written than requested
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes accepted by the link
        written: usize,
        /// Bytes handed to the link
        expected: usize,
    },

    /// Bus or driver fault
    #[error("Bus error: {0}")]
    Bus(String),
}

impl LinkError {
    /// Create a bus error from any message
    pub fn bus<S: Into<String>>(message: S) -> Self {
        Self::Bus(message.into())
    }
}

/// Error surfaced by the transport to its caller
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the session failed
    #[error("Failed to open session: {0}")]
    OpenFailed(Box<Self>),

    /// Configuration rejected before touching the link
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Checksum failures outlived the retransmission budget
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Malformed blocks outlived the retransmission budget
    #[error("Malformed block: {0}")]
    Malformed(&'static str),

    /// Peer violated the protocol
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    /// No response within the block or exchange timeout
    #[error("Operation timed out")]
    Timeout,

    /// Wait time extensions exceeded their ceiling
    #[error("Wait time extension ceiling exceeded")]
    WtxExceeded,

    /// Resynchronisation failed, the session was closed
    #[error("Recovery exhausted, session closed")]
    RecoveryExhausted,

    /// Operation attempted on a closed session
    #[error("Session is closed")]
    Closed,

    /// Response does not fit the read buffer
    #[error("Buffer overflow: capacity {capacity}, needed {needed}")]
    BufferOverflow {
        /// Fixed buffer capacity
        capacity: usize,
        /// Bytes the write required
        needed: usize,
    },

    /// Link fault that outlived the retransmission budget
    #[error("Link error: {0}")]
    Link(LinkError),
}

impl TransportError {
    /// Wrap an error as an open failure
    pub fn open_failed(error: Self) -> Self {
        match error {
            Self::OpenFailed(_) => error,
            other => Self::OpenFailed(Box::new(other)),
        }
    }

    /// Whether the session had to be closed and must be reopened
    pub const fn requires_reopen(&self) -> bool {
        matches!(
            self,
            Self::RecoveryExhausted | Self::Closed | Self::OpenFailed(_)
        )
    }
}

impl From<FrameError> for TransportError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::ChecksumMismatch { .. } => Self::ChecksumMismatch,
            FrameError::Malformed(reason) => Self::Malformed(reason),
            FrameError::Oversized { .. } => Self::Malformed("oversized block"),
            FrameError::BufferTooSmall { needed, available } => Self::BufferOverflow {
                capacity: available,
                needed,
            },
        }
    }
}

impl From<LinkError> for TransportError {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::Timeout => Self::Timeout,
            LinkError::Closed => Self::Closed,
            other => Self::Link(other),
        }
    }
}
