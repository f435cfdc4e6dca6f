//! Session context: one open connection to a secure element

mod exchange;

use std::{fmt, time::Duration, time::Instant};

use tracing::{debug, error, instrument, warn};

use crate::{
    atr::Atr,
    block::{SHORT_LEN_MAX, Seq},
    buffer::FixedBuffer,
    codec::FrameCodec,
    config::T1Config,
    error::{ConfigError, Result, TransportError},
    link::Link,
    status::LinkStatus,
};

use exchange::{Fault, Inbound};

/// Protocol counters kept for the lifetime of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Blocks written to the link, retransmissions included
    pub blocks_sent: u64,
    /// Complete blocks read from the link
    pub blocks_received: u64,
    /// Blocks sent again or answered with a negative acknowledgement
    pub retransmissions: u64,
    /// Received blocks with a bad epilogue
    pub checksum_failures: u64,
    /// Wait time extensions granted
    pub wtx_requests: u64,
    /// Successful resynchronisations
    pub resyncs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct WtxState {
    requests: u32,
    extension: Duration,
}

/// T=1 session over a [`Link`]
///
/// Every protocol operation takes `&mut self`; a session is driven by one
/// caller at a time.
pub struct Session<L: Link> {
    link: L,
    config: T1Config,
    codec: FrameCodec,
    status: LinkStatus,
    send_seq: Seq,
    recv_seq: Seq,
    retries: u32,
    read_buffer: FixedBuffer,
    /// Encoded I-block awaiting acknowledgement
    command_buffer: FixedBuffer,
    rx_frame: FixedBuffer,
    /// Block received by `wait_for_wtx`, consumed by the next `read`
    parked: Option<std::result::Result<Inbound, Fault>>,
    wtx: WtxState,
    deadline: Option<Instant>,
    /// The final command block is on the bus and no response arrived yet
    command_pending: bool,
    atr: Option<Atr>,
    statistics: Statistics,
}

impl<L: Link> fmt::Debug for Session<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("status", &self.status)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("read_buffer", &self.read_buffer)
            .field("parked", &self.parked.is_some())
            .field("statistics", &self.statistics)
            .finish_non_exhaustive()
    }
}

impl<L: Link> Session<L> {
    /// Create a closed session after validating `config`
    ///
    /// All buffers are allocated here and never grow afterwards.
    pub fn new(link: L, config: T1Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let codec = FrameCodec::from_config(&config);
        // Incoming blocks may be as large as the secure element's own limit
        let rx_capacity = codec.frame_len(config.max_block_payload.max(SHORT_LEN_MAX));

        Ok(Self {
            link,
            codec,
            status: LinkStatus::Closed,
            send_seq: Seq::ZERO,
            recv_seq: Seq::ZERO,
            retries: 0,
            read_buffer: FixedBuffer::with_capacity(config.read_buffer_capacity),
            command_buffer: FixedBuffer::with_capacity(codec.frame_capacity()),
            rx_frame: FixedBuffer::with_capacity(rx_capacity),
            parked: None,
            wtx: WtxState::default(),
            deadline: None,
            command_pending: false,
            atr: None,
            statistics: Statistics::default(),
            config,
        })
    }

    /// Create a session and open it
    pub fn connect(link: L, config: T1Config) -> Result<Self> {
        let mut session = Self::new(link, config)?;
        session.open()?;
        Ok(session)
    }

    /// Open the link and run the configured handshake
    ///
    /// Does nothing if the session is already open. On failure the link is
    /// closed again and the session stays [`LinkStatus::Closed`].
    #[instrument(level = "debug", skip_all, fields(handshake = ?self.config.handshake))]
    pub fn open(&mut self) -> Result<()> {
        if self.status.is_open() {
            return Ok(());
        }

        self.link
            .open()
            .map_err(|e| TransportError::open_failed(e.into()))?;

        self.reset_sequence();
        self.reset_exchange();
        self.codec = FrameCodec::from_config(&self.config);
        self.atr = None;

        match self.handshake() {
            Ok(()) => {
                self.deadline = None;
                self.transition(LinkStatus::Open);
                Ok(())
            }
            Err(fault) => {
                let error = fault.into_error();
                warn!(%error, "Handshake failed");
                self.link.close();
                self.deadline = None;
                Err(TransportError::open_failed(error))
            }
        }
    }

    /// Close the session and release the link
    pub fn close(&mut self) {
        if self.status.is_open() {
            debug!("Closing session");
            self.link.close();
        }
        self.transition(LinkStatus::Closed);
        self.reset_exchange();
        self.deadline = None;
        self.read_buffer.clear();
        self.command_pending = false;
    }

    /// Current status
    pub const fn status(&self) -> LinkStatus {
        self.status
    }

    /// Drop any buffered response bytes and any block parked by
    /// [`wait_for_wtx`](Self::wait_for_wtx)
    ///
    /// Idempotent and leaves the status untouched.
    pub fn reset_read_buffer(&mut self) {
        self.read_buffer.clear();
        self.parked = None;
    }

    /// Same as [`reset_read_buffer`](Self::reset_read_buffer)
    pub fn clear_read_buffer(&mut self) {
        self.reset_read_buffer();
    }

    /// Response bytes of the last completed read
    pub fn response(&self) -> &[u8] {
        self.read_buffer.as_slice()
    }

    /// ATR returned by the last interface soft reset
    pub const fn atr(&self) -> Option<&Atr> {
        self.atr.as_ref()
    }

    /// Session configuration
    pub const fn config(&self) -> &T1Config {
        &self.config
    }

    /// Largest payload currently sent in one I-block
    pub const fn max_block_payload(&self) -> usize {
        self.codec.max_payload()
    }

    /// Protocol counters
    pub const fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Wait time extension granted in the current exchange
    pub const fn wtx_extension(&self) -> Duration {
        self.wtx.extension
    }

    /// The underlying link
    pub const fn link(&self) -> &L {
        &self.link
    }

    /// The underlying link, mutably
    pub const fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn transition(&mut self, next: LinkStatus) {
        if self.status.can_transition_to(next) {
            if self.status != next {
                debug!(from = %self.status, to = %next, "Status change");
            }
            self.status = next;
        } else if cfg!(debug_assertions) {
            panic!("invalid status transition {} -> {}", self.status, next);
        } else {
            error!(from = %self.status, to = %next, "Invalid status transition");
            self.status = LinkStatus::Recovery;
        }
    }

    /// Enter Busy for one API call
    fn begin(&mut self) -> Result<()> {
        match self.status {
            LinkStatus::Closed => return Err(TransportError::Closed),
            LinkStatus::Open | LinkStatus::Idle => {}
            LinkStatus::Busy | LinkStatus::Recovery => {
                return Err(TransportError::Protocol("exchange already in progress"));
            }
        }
        self.transition(LinkStatus::Busy);
        self.retries = 0;
        self.deadline = Instant::now().checked_add(self.config.exchange_timeout);
        Ok(())
    }

    /// Run `op` inside one Busy period, recovering on escalation
    fn run<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> std::result::Result<T, Fault>,
    ) -> Result<T> {
        self.begin()?;
        let result = op(self);
        self.deadline = None;
        match result {
            Ok(value) => {
                self.transition(LinkStatus::Idle);
                Ok(value)
            }
            Err(fault) => Err(self.recover(fault)),
        }
    }

    fn reset_sequence(&mut self) {
        self.send_seq = Seq::ZERO;
        self.recv_seq = Seq::ZERO;
        self.retries = 0;
    }

    fn reset_exchange(&mut self) {
        self.parked = None;
        self.wtx = WtxState::default();
    }

    /// Resynchronise after an escalated fault
    ///
    /// Returns the error to report: the escalated one after a successful
    /// resynchronisation, otherwise [`TransportError::RecoveryExhausted`].
    fn recover(&mut self, fault: Fault) -> TransportError {
        let error = fault.into_error();
        if !self.status.is_open() {
            return error;
        }

        self.transition(LinkStatus::Recovery);
        warn!(%error, "Exchange failed, resynchronising");
        self.read_buffer.clear();
        self.command_pending = false;
        self.reset_exchange();
        self.deadline = None;

        for attempt in 1..=self.config.resync_attempts {
            match self.resync_once() {
                Ok(()) => {
                    self.statistics.resyncs += 1;
                    self.reset_sequence();
                    self.transition(LinkStatus::Idle);
                    return error;
                }
                Err(fault) => {
                    warn!(attempt, error = %fault.error(), "Resynchronisation failed");
                }
            }
        }

        error!(%error, "Recovery exhausted, closing session");
        self.link.close();
        self.transition(LinkStatus::Closed);
        TransportError::RecoveryExhausted
    }
}

impl<L: Link> Drop for Session<L> {
    fn drop(&mut self) {
        if self.status.is_open() {
            self.link.close();
        }
    }
}
