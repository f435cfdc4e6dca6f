//! Shared helpers for session tests
#![allow(dead_code, unreachable_pub)]

use std::{collections::VecDeque, thread, time::Duration};

use se05x_t1::{
    Block, BlockKind, FrameCodec, Link, LinkError, ReadyError, Seq, SupervisoryKind, T1Config,
};

/// ATR payload of an SE050 running JCOP4
pub const SE050_ATR: &str = "00a0000003960403e800fe020b03e80801000000006400000a4a434f5034204154504f";

/// What the secure element does when the host next reads
#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver a complete block
    Frame(Vec<u8>),
    /// Let the next block read time out
    Timeout,
}

/// Link replaying a fixed script of secure element behaviour
#[derive(Debug, Default)]
pub struct ScriptedLink {
    script: VecDeque<Step>,
    current: VecDeque<u8>,
    /// Every frame written by the host
    pub writes: Vec<Vec<u8>>,
    /// Timeout passed to the first read of each block
    pub read_timeouts: Vec<Duration>,
    /// Fail every read and write with a timeout
    pub always_timeout: bool,
    /// Fail `open`
    pub refuse_open: bool,
    /// Number of `close` calls
    pub closed: usize,
    /// Time the secure element takes before each block
    pub read_delay: Duration,
}

impl ScriptedLink {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Link whose `open` fails
    pub fn refusing() -> Self {
        Self {
            refuse_open: true,
            ..Default::default()
        }
    }

    /// Append more secure element behaviour
    pub fn push(&mut self, step: Step) {
        self.script.push_back(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.script.extend(steps);
    }

    /// Steps not consumed yet
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Link for ScriptedLink {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.refuse_open {
            return Err(LinkError::Nack);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize, LinkError> {
        self.writes.push(bytes.to_vec());
        if self.always_timeout {
            return Err(LinkError::Timeout);
        }
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if self.always_timeout {
            return Err(LinkError::Timeout);
        }
        if self.current.is_empty() {
            self.read_timeouts.push(timeout);
            if !self.read_delay.is_zero() {
                thread::sleep(self.read_delay);
            }
            match self.script.pop_front() {
                Some(Step::Frame(frame)) => self.current.extend(frame),
                Some(Step::Timeout) | None => return Err(LinkError::Timeout),
            }
        }
        let n = buf.len().min(self.current.len());
        for (slot, byte) in buf.iter_mut().zip(self.current.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.closed += 1;
    }
}

/// Builds secure element blocks and decodes host blocks
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    codec: FrameCodec,
}

impl Peer {
    pub fn new(config: &T1Config) -> Self {
        let codec = FrameCodec::from_config(config).peer_view();
        Self {
            codec: codec.with_max_payload(codec.max_payload().max(254)),
        }
    }

    fn frame(&self, block: &Block<'_>) -> Step {
        Step::Frame(self.codec.encode_to_vec(block).unwrap())
    }

    /// I-block from the secure element
    pub fn i_block(&self, seq: Seq, more: bool, payload: &[u8]) -> Step {
        self.frame(&self.codec.block(BlockKind::Information { seq, more }, payload))
    }

    pub fn ack(&self, seq: Seq) -> Step {
        self.frame(&self.codec.receive_ready(seq, ReadyError::None))
    }

    pub fn nack(&self, seq: Seq, error: ReadyError) -> Step {
        self.frame(&self.codec.receive_ready(seq, error))
    }

    pub fn s_response(&self, kind: SupervisoryKind, payload: &[u8]) -> Step {
        self.frame(&self.codec.supervisory(kind, true, payload))
    }

    pub fn s_request(&self, kind: SupervisoryKind, payload: &[u8]) -> Step {
        self.frame(&self.codec.supervisory(kind, false, payload))
    }

    /// Answer to the interface soft reset
    pub fn atr(&self) -> Step {
        self.s_response(SupervisoryKind::SoftReset, &hex::decode(SE050_ATR).unwrap())
    }

    /// Decode a block written by the host
    pub fn decode<'a>(&self, raw: &'a [u8]) -> Block<'a> {
        self.codec.decode(raw).unwrap()
    }

    /// Block kinds of every host write
    pub fn kinds(&self, writes: &[Vec<u8>]) -> Vec<BlockKind> {
        writes.iter().map(|raw| self.decode(raw).kind).collect()
    }
}

/// Configuration with short timeouts and a resync handshake
pub fn fast_config() -> T1Config {
    T1Config::new()
        .with_block_timeout(Duration::from_millis(100))
        .with_handshake(se05x_t1::OpenHandshake::Resync)
}
