//! Block encoding and decoding
//!
//! The codec is stateless: sequence numbers and chaining state belong to the
//! session that drives it.

use alloc::{vec, vec::Vec};
use core::iter::FusedIterator;

use crate::{
    block::{
        Block, BlockKind, EXTENDED_LEN_MARKER, MAX_BLOCK_PAYLOAD, NAD_HOST_TO_SE, NAD_SE_TO_HOST,
        ReadyError, SHORT_LEN_MAX, Seq, SupervisoryKind, prologue_len,
    },
    checksum::Checksum,
    config::T1Config,
    error::FrameError,
};

/// Bytes read before the length of the remaining block is known
pub const MIN_PROLOGUE: usize = 3;

/// Encoder and decoder for blocks of one link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    node_address: u8,
    peer_address: u8,
    max_payload: usize,
    checksum: Checksum,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(SHORT_LEN_MAX, Checksum::Crc16)
    }
}

impl FrameCodec {
    /// Create a host side codec using the SE05x node addresses
    pub const fn new(max_payload: usize, checksum: Checksum) -> Self {
        Self {
            node_address: NAD_HOST_TO_SE,
            peer_address: NAD_SE_TO_HOST,
            max_payload: clamp_payload(max_payload),
            checksum,
        }
    }

    /// Create a codec from a transport configuration
    pub const fn from_config(config: &T1Config) -> Self {
        Self::new(config.max_block_payload, config.checksum)
            .with_addresses(config.node_address, config.peer_address)
    }

    /// Set the address written into outgoing blocks and the one expected on
    /// incoming blocks
    pub const fn with_addresses(mut self, node_address: u8, peer_address: u8) -> Self {
        self.node_address = node_address;
        self.peer_address = peer_address;
        self
    }

    /// Set the largest payload carried by one outgoing I-block
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = clamp_payload(max_payload);
        self
    }

    /// The codec seen from the other end of the link
    pub const fn peer_view(self) -> Self {
        self.with_addresses(self.peer_address, self.node_address)
    }

    /// Address written into outgoing blocks
    pub const fn node_address(&self) -> u8 {
        self.node_address
    }

    /// Address expected on incoming blocks
    pub const fn peer_address(&self) -> u8 {
        self.peer_address
    }

    /// Largest payload carried by one outgoing I-block
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Epilogue algorithm
    pub const fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Encoded size of a block carrying `payload_len` bytes
    pub const fn frame_len(&self, payload_len: usize) -> usize {
        prologue_len(payload_len) + payload_len + self.checksum.width()
    }

    /// Encoded size of the largest outgoing I-block
    pub const fn frame_capacity(&self) -> usize {
        self.frame_len(self.max_payload)
    }

    /// Build an outgoing block and compute its checksum
    pub fn block<'a>(&self, kind: BlockKind, payload: &'a [u8]) -> Block<'a> {
        let (prologue, len) = prologue(self.node_address, kind.pcb(), payload.len());
        let mut state = self.checksum.start();
        state.update(&prologue[..len]);
        state.update(payload);
        Block {
            node_address: self.node_address,
            kind,
            payload,
            checksum: state.finish(),
        }
    }

    /// R-block acknowledging up to `seq`, optionally reporting an error
    pub fn receive_ready(&self, seq: Seq, error: ReadyError) -> Block<'static> {
        self.block(BlockKind::ReceiveReady { seq, error }, &[])
    }

    /// S-block request or response
    pub fn supervisory<'a>(
        &self,
        kind: SupervisoryKind,
        response: bool,
        payload: &'a [u8],
    ) -> Block<'a> {
        self.block(BlockKind::Supervisory { kind, response }, payload)
    }

    /// Split `payload` into chained I-blocks starting at sequence number `seq`
    ///
    /// An empty payload yields a single empty I-block.
    pub const fn encode<'a>(&self, payload: &'a [u8], seq: Seq) -> Chain<'a> {
        Chain {
            codec: *self,
            remaining: payload,
            seq,
            done: false,
        }
    }

    /// Serialise `block` into `out`, returning the number of bytes written
    pub fn encode_block(&self, block: &Block<'_>, out: &mut [u8]) -> Result<usize, FrameError> {
        let len = block.payload.len();
        let max = match block.kind {
            BlockKind::Information { .. } => self.max_payload,
            _ => MAX_BLOCK_PAYLOAD,
        };
        if len > max {
            return Err(FrameError::Oversized { len, max });
        }

        let needed = self.frame_len(len);
        if out.len() < needed {
            return Err(FrameError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let (prologue, prologue_len) = prologue(block.node_address, block.kind.pcb(), len);
        out[..prologue_len].copy_from_slice(&prologue[..prologue_len]);
        out[prologue_len..prologue_len + len].copy_from_slice(block.payload);
        self.checksum
            .write(block.checksum, &mut out[prologue_len + len..needed]);
        Ok(needed)
    }

    /// Serialise `block` into a new vector
    pub fn encode_to_vec(&self, block: &Block<'_>) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![0; self.frame_len(block.payload.len())];
        self.encode_block(block, &mut out)?;
        Ok(out)
    }

    /// Number of prologue bytes still missing after the first three
    pub const fn extended_prologue(first: &[u8; MIN_PROLOGUE]) -> usize {
        if first[2] == EXTENDED_LEN_MARKER {
            2
        } else {
            0
        }
    }

    /// Number of payload and epilogue bytes following a complete prologue
    pub fn body_len(&self, prologue: &[u8]) -> Result<usize, FrameError> {
        let payload_len = match *prologue {
            [_, _, EXTENDED_LEN_MARKER, high, low] => usize::from(u16::from_be_bytes([high, low])),
            [_, _, len] if len != EXTENDED_LEN_MARKER => usize::from(len),
            _ => return Err(FrameError::Malformed("incomplete prologue")),
        };
        Ok(payload_len + self.checksum.width())
    }

    /// Decode one complete block received from the peer
    ///
    /// Lengths are checked first, then the checksum, then the control byte,
    /// address and payload.
    pub fn decode<'a>(&self, raw: &'a [u8]) -> Result<Block<'a>, FrameError> {
        let width = self.checksum.width();
        if raw.len() < MIN_PROLOGUE + width {
            return Err(FrameError::Malformed("truncated block"));
        }

        let (prologue_len, payload_len) = if raw[2] == EXTENDED_LEN_MARKER {
            if raw.len() < MIN_PROLOGUE + 2 + width {
                return Err(FrameError::Malformed("truncated block"));
            }
            (5, usize::from(u16::from_be_bytes([raw[3], raw[4]])))
        } else {
            (MIN_PROLOGUE, usize::from(raw[2]))
        };

        let body_end = prologue_len + payload_len;
        if raw.len() != body_end + width {
            return Err(FrameError::Malformed("length does not match block size"));
        }

        let expected = self.checksum.compute(&raw[..body_end]);
        let actual = self.checksum.read(&raw[body_end..]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let kind =
            BlockKind::from_pcb(raw[1]).ok_or(FrameError::Malformed("unknown block type"))?;
        if raw[0] != self.peer_address {
            return Err(FrameError::Malformed("unexpected node address"));
        }

        let payload = &raw[prologue_len..body_end];
        match kind {
            BlockKind::ReceiveReady { .. } if !payload.is_empty() => {
                return Err(FrameError::Malformed("R-block with payload"));
            }
            BlockKind::Supervisory {
                kind: SupervisoryKind::Wtx,
                ..
            } if payload.len() != 1 => {
                return Err(FrameError::Malformed("WTX without multiplier"));
            }
            _ => {}
        }

        Ok(Block {
            node_address: raw[0],
            kind,
            payload,
            checksum: actual,
        })
    }
}

/// Lazy sequence of chained I-blocks produced by [`FrameCodec::encode`]
#[derive(Debug, Clone)]
pub struct Chain<'a> {
    codec: FrameCodec,
    remaining: &'a [u8],
    seq: Seq,
    done: bool,
}

impl<'a> Iterator for Chain<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let take = self.remaining.len().min(self.codec.max_payload);
        let (chunk, rest) = self.remaining.split_at(take);
        let more = !rest.is_empty();
        let block = self.codec.block(
            BlockKind::Information {
                seq: self.seq,
                more,
            },
            chunk,
        );
        self.remaining = rest;
        self.seq = self.seq.next();
        self.done = !more;
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = if self.done {
            0
        } else {
            self.remaining.len().div_ceil(self.codec.max_payload).max(1)
        };
        (count, Some(count))
    }
}

impl ExactSizeIterator for Chain<'_> {}

impl FusedIterator for Chain<'_> {}

const fn clamp_payload(max_payload: usize) -> usize {
    if max_payload == 0 {
        1
    } else if max_payload > MAX_BLOCK_PAYLOAD {
        MAX_BLOCK_PAYLOAD
    } else {
        max_payload
    }
}

fn prologue(node_address: u8, pcb: u8, payload_len: usize) -> ([u8; 5], usize) {
    if payload_len <= SHORT_LEN_MAX {
        ([node_address, pcb, payload_len as u8, 0, 0], 3)
    } else {
        let [high, low] = (payload_len as u16).to_be_bytes();
        ([node_address, pcb, EXTENDED_LEN_MARKER, high, low], 5)
    }
}
