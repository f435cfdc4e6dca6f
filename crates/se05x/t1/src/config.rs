//! Configuration options for the T=1 transport

use core::time::Duration;

use crate::{
    block::{MAX_BLOCK_PAYLOAD, NAD_HOST_TO_SE, NAD_SE_TO_HOST, SHORT_LEN_MAX},
    checksum::Checksum,
    error::ConfigError,
};

/// Exchange performed by [`Session::open`](crate::Session::open) once the
/// link is up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenHandshake {
    /// Interface soft reset, answered with the ATR
    #[default]
    SoftReset,
    /// Plain resynchronisation, no ATR
    Resync,
}

/// Configuration options for a T=1 session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct T1Config {
    /// Time to wait for a single block
    pub block_timeout: Duration,

    /// Upper bound for one complete write or read call
    pub exchange_timeout: Duration,

    /// Largest cumulative wait time extension granted within one exchange
    pub wtx_ceiling: Duration,

    /// Largest number of wait time extension requests within one exchange
    pub max_wtx_requests: u32,

    /// Retransmissions allowed per block before recovery starts
    pub block_retransmits: u32,

    /// Resynchronisation attempts before the session is closed
    pub resync_attempts: u32,

    /// Epilogue algorithm
    pub checksum: Checksum,

    /// Largest payload sent in one I-block
    pub max_block_payload: usize,

    /// Capacity of the response buffer
    pub read_buffer_capacity: usize,

    /// Address of outgoing blocks
    pub node_address: u8,

    /// Address expected on incoming blocks
    pub peer_address: u8,

    /// Handshake run by `open`
    pub handshake: OpenHandshake,

    /// Limit the block payload to the IFSC announced in the ATR
    pub adopt_atr_ifsc: bool,
}

impl Default for T1Config {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_millis(1000),
            exchange_timeout: Duration::from_secs(30),
            wtx_ceiling: Duration::from_secs(20),
            max_wtx_requests: 64,
            block_retransmits: 3,
            resync_attempts: 3,
            checksum: Checksum::Crc16,
            max_block_payload: SHORT_LEN_MAX,
            read_buffer_capacity: 4096,
            node_address: NAD_HOST_TO_SE,
            peer_address: NAD_SE_TO_HOST,
            handshake: OpenHandshake::SoftReset,
            adopt_atr_ifsc: false,
        }
    }
}

impl T1Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the single block timeout
    pub const fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the whole exchange timeout
    pub const fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set the wait time extension limits
    pub const fn with_wtx_limits(mut self, ceiling: Duration, max_requests: u32) -> Self {
        self.wtx_ceiling = ceiling;
        self.max_wtx_requests = max_requests;
        self
    }

    /// Set the per-block retransmission budget
    pub const fn with_block_retransmits(mut self, retransmits: u32) -> Self {
        self.block_retransmits = retransmits;
        self
    }

    /// Set the resynchronisation budget
    pub const fn with_resync_attempts(mut self, attempts: u32) -> Self {
        self.resync_attempts = attempts;
        self
    }

    /// Set the epilogue algorithm
    pub const fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set the largest I-block payload
    pub const fn with_max_block_payload(mut self, max_payload: usize) -> Self {
        self.max_block_payload = max_payload;
        self
    }

    /// Set the response buffer capacity
    pub const fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }

    /// Set the node addresses
    pub const fn with_addresses(mut self, node_address: u8, peer_address: u8) -> Self {
        self.node_address = node_address;
        self.peer_address = peer_address;
        self
    }

    /// Set the open handshake
    pub const fn with_handshake(mut self, handshake: OpenHandshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Set whether the ATR IFSC limits the block payload
    pub const fn with_adopt_atr_ifsc(mut self, adopt: bool) -> Self {
        self.adopt_atr_ifsc = adopt;
        self
    }

    /// Smallest usable read buffer for this configuration
    pub const fn min_read_buffer(&self) -> usize {
        if self.max_block_payload > 2 {
            self.max_block_payload
        } else {
            2
        }
    }

    /// Check the configuration before any link traffic
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("block timeout"));
        }
        if self.exchange_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("exchange timeout"));
        }
        if self.exchange_timeout < self.block_timeout {
            return Err(ConfigError::ExchangeShorterThanBlock {
                exchange: self.exchange_timeout,
                block: self.block_timeout,
            });
        }
        if self.max_block_payload == 0 || self.max_block_payload > MAX_BLOCK_PAYLOAD {
            return Err(ConfigError::BlockPayloadOutOfRange(self.max_block_payload));
        }
        let minimum = self.min_read_buffer();
        if self.read_buffer_capacity < minimum {
            return Err(ConfigError::ReadBufferTooSmall {
                capacity: self.read_buffer_capacity,
                minimum,
            });
        }
        if self.node_address == self.peer_address {
            return Err(ConfigError::AddressCollision(self.node_address));
        }
        Ok(())
    }
}
