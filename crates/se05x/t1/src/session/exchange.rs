//! Block exchange: chaining, acknowledgement, wait time extension and
//! retransmission

use std::{ops::Range, time::Duration, time::Instant};

use tracing::{debug, instrument, trace, warn};

use super::Session;
use crate::{
    atr::Atr,
    block::{Block, BlockKind, ReadyError, SupervisoryKind},
    codec::{FrameCodec, MIN_PROLOGUE},
    config::OpenHandshake,
    error::{FrameError, LinkError, TransportError},
    link::Link,
};

/// Largest encoded R- or S-block the host sends
const CONTROL_FRAME_MAX: usize = 16;

/// A fault inside an exchange
#[derive(Debug)]
pub(super) enum Fault {
    /// Costs one retry of the current block
    Retry(TransportError),
    /// Skips the retry budget and goes straight to recovery
    Escalate(TransportError),
}

impl Fault {
    pub(super) fn into_error(self) -> TransportError {
        match self {
            Self::Retry(error) | Self::Escalate(error) => error,
        }
    }

    pub(super) const fn error(&self) -> &TransportError {
        match self {
            Self::Retry(error) | Self::Escalate(error) => error,
        }
    }
}

impl From<LinkError> for Fault {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::Closed => Self::Escalate(TransportError::Closed),
            other => Self::Retry(other.into()),
        }
    }
}

/// A decoded block whose payload sits in the receive frame
#[derive(Debug)]
pub(super) struct Inbound {
    kind: BlockKind,
    payload: Range<usize>,
}

/// Error recorded against a block the exchange did not expect
const fn rejection(kind: BlockKind) -> TransportError {
    match kind {
        BlockKind::ReceiveReady {
            error: ReadyError::Checksum,
            ..
        } => TransportError::ChecksumMismatch,
        BlockKind::ReceiveReady {
            error: ReadyError::Other,
            ..
        } => TransportError::Malformed("block rejected by peer"),
        _ => TransportError::Protocol("unexpected block"),
    }
}

fn write_all<L: Link>(link: &mut L, frame: &[u8], timeout: Duration) -> Result<(), LinkError> {
    let written = link.write(frame, timeout)?;
    if written != frame.len() {
        return Err(LinkError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    Ok(())
}

fn read_exact<L: Link>(link: &mut L, buf: &mut [u8], timeout: Duration) -> Result<(), LinkError> {
    let mut filled = 0;
    while filled < buf.len() {
        match link.read(&mut buf[filled..], timeout)? {
            0 => return Err(LinkError::Timeout),
            n => filled += n,
        }
    }
    Ok(())
}

impl<L: Link> Session<L> {
    /// Send a command APDU, chaining it over as many I-blocks as needed
    ///
    /// Clears the read buffer first. Completes once the final block is on the
    /// bus; its acknowledgement is the response collected by [`Self::read`].
    #[instrument(level = "debug", skip_all, fields(len = command.len()))]
    pub fn write_frame(&mut self, command: &[u8]) -> Result<(), TransportError> {
        self.run(|session| session.send_chain(command))
    }

    /// Collect the response to the last command
    ///
    /// Wait time extension requests are answered transparently. The returned
    /// bytes stay valid until the next `write_frame` or `reset_read_buffer`.
    #[instrument(level = "debug", skip_all)]
    pub fn read(&mut self) -> Result<&[u8], TransportError> {
        self.run(Self::receive_response)?;
        Ok(self.read_buffer.as_slice())
    }

    /// Send a command and return its response
    pub fn transceive(&mut self, command: &[u8]) -> Result<&[u8], TransportError> {
        self.write_frame(command)?;
        self.read()
    }

    /// Wait until the next block that is not a wait time extension request
    ///
    /// The block is kept for the next [`Self::read`]. Only escalated faults
    /// are reported here; others surface from `read`.
    #[instrument(level = "debug", skip_all)]
    pub fn wait_for_wtx(&mut self) -> Result<(), TransportError> {
        if self.parked.is_some() {
            return Ok(());
        }
        self.run(|session| match session.await_block() {
            Err(Fault::Escalate(error)) => Err(Fault::Escalate(error)),
            received => {
                session.parked = Some(received);
                Ok(())
            }
        })
    }

    /// Resynchronise sequence numbers with the secure element
    #[instrument(level = "debug", skip_all)]
    pub fn resync(&mut self) -> Result<(), TransportError> {
        self.run(|session| {
            session.supervisory_exchange(SupervisoryKind::Resync, &[])?;
            session.statistics.resyncs += 1;
            session.reset_sequence();
            Ok(())
        })
    }

    /// Reset the secure element's communication interface and refresh the ATR
    #[instrument(level = "debug", skip_all)]
    pub fn soft_reset(&mut self) -> Result<(), TransportError> {
        self.run(|session| {
            session.reset_exchange();
            session.command_pending = false;
            session.soft_reset_exchange()?;
            session.reset_sequence();
            Ok(())
        })
    }

    /// Close the current APDU session on the secure element
    #[instrument(level = "debug", skip_all)]
    pub fn end_apdu_session(&mut self) -> Result<(), TransportError> {
        self.run(|session| {
            session
                .supervisory_exchange(SupervisoryKind::EndApduSession, &[])
                .map(drop)
        })
    }

    pub(super) fn handshake(&mut self) -> Result<(), Fault> {
        self.deadline = Instant::now().checked_add(self.config.exchange_timeout);
        match self.config.handshake {
            OpenHandshake::SoftReset => self.soft_reset_exchange(),
            OpenHandshake::Resync => self
                .supervisory_exchange(SupervisoryKind::Resync, &[])
                .map(drop),
        }
    }

    fn soft_reset_exchange(&mut self) -> Result<(), Fault> {
        let payload = self.supervisory_exchange(SupervisoryKind::SoftReset, &[])?;
        let atr = match Atr::parse(&self.rx_frame.as_slice()[payload]) {
            Ok(atr) => atr,
            Err(error) => {
                warn!(%error, "Ignoring unparsable ATR");
                self.atr = None;
                return Ok(());
            }
        };

        debug!(
            bwt = ?atr.block_waiting_time,
            ifsc = atr.ifsc,
            historical = %hex::encode(&atr.historical_bytes),
            "Received ATR"
        );
        if self.config.adopt_atr_ifsc && atr.ifsc > 0 {
            let max_payload = self.config.max_block_payload.min(usize::from(atr.ifsc));
            self.codec = FrameCodec::from_config(&self.config).with_max_payload(max_payload);
        }
        self.atr = Some(atr);
        Ok(())
    }

    fn send_chain(&mut self, command: &[u8]) -> Result<(), Fault> {
        self.read_buffer.clear();
        self.reset_exchange();
        self.command_pending = false;

        let codec = self.codec;
        for block in codec.encode(command, self.send_seq) {
            self.stage(&block)?;
            self.retries = 0;
            if block.is_chained() {
                self.send_chained()?;
            } else {
                self.send_final()?;
            }
            self.send_seq = self.send_seq.next();
        }
        self.command_pending = true;
        Ok(())
    }

    /// Encode `block` into the command buffer for (re)transmission
    fn stage(&mut self, block: &Block<'_>) -> Result<(), Fault> {
        let codec = self.codec;
        self.command_buffer
            .fill_with(|out| codec.encode_block(block, out))
            .map_err(|e| Fault::Escalate(e.into()))
    }

    fn send_chained(&mut self) -> Result<(), Fault> {
        let expected = self.send_seq.next();
        loop {
            let received = self.transmit_command().and_then(|()| self.await_block());
            match received {
                Ok(Inbound {
                    kind: BlockKind::ReceiveReady { seq, error },
                    ..
                }) if seq == expected && error == ReadyError::None => {
                    trace!(seq = %self.send_seq, "Chained block acknowledged");
                    return Ok(());
                }
                Ok(inbound) => self.retry(Fault::Retry(rejection(inbound.kind)))?,
                Err(fault) => self.retry(fault)?,
            }
        }
    }

    fn send_final(&mut self) -> Result<(), Fault> {
        loop {
            match self.transmit_command() {
                Ok(()) => return Ok(()),
                Err(fault) => self.retry(fault)?,
            }
        }
    }

    fn receive_response(&mut self) -> Result<(), Fault> {
        self.read_buffer.clear();
        loop {
            let received = match self.parked.take() {
                Some(parked) => parked,
                None => self.await_block(),
            };

            match received {
                Ok(Inbound {
                    kind: BlockKind::Information { seq, more },
                    payload,
                }) if seq == self.recv_seq => {
                    let data = &self.rx_frame.as_slice()[payload];
                    self.read_buffer
                        .extend_from_slice(data)
                        .map_err(Fault::Escalate)?;
                    self.recv_seq = seq.next();
                    self.command_pending = false;
                    self.retries = 0;
                    if !more {
                        debug!(len = self.read_buffer.len(), "Response complete");
                        return Ok(());
                    }
                    let ack = self.codec.receive_ready(self.recv_seq, ReadyError::None);
                    if let Err(fault) = self.send_control(&ack) {
                        self.retry(fault)?;
                    }
                }
                Ok(Inbound {
                    kind: BlockKind::ReceiveReady { seq, .. },
                    ..
                }) if self.command_pending && seq == self.send_seq.next() => {
                    self.retry(Fault::Retry(TransportError::Protocol(
                        "command block not received",
                    )))?;
                    if let Err(fault) = self.transmit_command() {
                        self.retry(fault)?;
                    }
                }
                Ok(inbound) => {
                    self.retry(Fault::Retry(rejection(inbound.kind)))?;
                    self.nack(ReadyError::Other)?;
                }
                Err(fault) => {
                    let error = match fault.error() {
                        TransportError::ChecksumMismatch => ReadyError::Checksum,
                        _ => ReadyError::Other,
                    };
                    self.retry(fault)?;
                    self.nack(error)?;
                }
            }
        }
    }

    /// Ask the secure element to repeat the block expected next
    fn nack(&mut self, error: ReadyError) -> Result<(), Fault> {
        let nack = self.codec.receive_ready(self.recv_seq, error);
        match self.send_control(&nack) {
            Ok(()) => Ok(()),
            Err(fault) => self.retry(fault),
        }
    }

    /// Exchange an S-block request for its response, returning the range of
    /// the response payload in the receive frame
    fn supervisory_exchange(
        &mut self,
        kind: SupervisoryKind,
        payload: &[u8],
    ) -> Result<Range<usize>, Fault> {
        self.retries = 0;
        let request = self.codec.supervisory(kind, false, payload);
        loop {
            let received = self.send_control(&request).and_then(|()| self.await_block());
            match received {
                Ok(Inbound {
                    kind: BlockKind::Supervisory {
                        kind: answered,
                        response: true,
                    },
                    payload,
                }) if answered == kind => return Ok(payload),
                Ok(inbound) => self.retry(Fault::Retry(rejection(inbound.kind)))?,
                Err(fault) => self.retry(fault)?,
            }
        }
    }

    /// One resynchronisation attempt, no retries
    pub(super) fn resync_once(&mut self) -> Result<(), Fault> {
        let request = self.codec.supervisory(SupervisoryKind::Resync, false, &[]);
        self.send_control(&request)?;
        match self.await_block()? {
            Inbound {
                kind:
                    BlockKind::Supervisory {
                        kind: SupervisoryKind::Resync,
                        response: true,
                    },
                ..
            } => Ok(()),
            inbound => Err(Fault::Retry(rejection(inbound.kind))),
        }
    }

    /// Charge one retry against the current block
    fn retry(&mut self, fault: Fault) -> Result<(), Fault> {
        let error = match fault {
            Fault::Escalate(_) => return Err(fault),
            Fault::Retry(error) => error,
        };
        self.retries += 1;
        if self.retries > self.config.block_retransmits {
            debug!(retries = self.retries, %error, "Retry budget exhausted");
            return Err(Fault::Escalate(error));
        }
        self.statistics.retransmissions += 1;
        warn!(attempt = self.retries, %error, "Retrying block");
        Ok(())
    }

    /// Wait for the next block, answering wait time extension and IFS
    /// requests along the way
    fn await_block(&mut self) -> Result<Inbound, Fault> {
        let mut timeout = self.config.block_timeout;
        loop {
            let inbound = self.receive_block(self.wait_timeout(timeout)?)?;
            timeout = self.config.block_timeout;

            let BlockKind::Supervisory {
                kind,
                response: false,
            } = inbound.kind
            else {
                return Ok(inbound);
            };
            match kind {
                SupervisoryKind::Wtx => {
                    let multiplier = [self.rx_frame.as_slice()[inbound.payload.start]];
                    timeout = self.extend_wait(multiplier[0])?;
                    let answer = self.codec.supervisory(kind, true, &multiplier);
                    self.send_control(&answer)?;
                }
                SupervisoryKind::Ifs if !inbound.payload.is_empty() => {
                    let mut size = [0u8; 2];
                    let len = inbound.payload.len().min(size.len());
                    size[..len].copy_from_slice(
                        &self.rx_frame.as_slice()[inbound.payload.start..][..len],
                    );
                    debug!(size = %hex::encode(&size[..len]), "Acknowledging IFS request");
                    let answer = self.codec.supervisory(kind, true, &size[..len]);
                    self.send_control(&answer)?;
                }
                _ => return Ok(inbound),
            }
        }
    }

    /// Grant a wait time extension of `multiplier` block timeouts
    fn extend_wait(&mut self, multiplier: u8) -> Result<Duration, Fault> {
        if multiplier == 0 {
            return Err(Fault::Retry(TransportError::Protocol(
                "wait time extension of zero",
            )));
        }

        self.wtx.requests = self.wtx.requests.saturating_add(1);
        let granted = self
            .config
            .block_timeout
            .checked_mul(u32::from(multiplier))
            .and_then(|extension| Some((extension, self.wtx.extension.checked_add(extension)?)))
            .filter(|(_, total)| {
                self.wtx.requests <= self.config.max_wtx_requests
                    && *total <= self.config.wtx_ceiling
            });
        let Some((extension, total)) = granted else {
            warn!(
                requests = self.wtx.requests,
                granted = ?self.wtx.extension,
                ceiling = ?self.config.wtx_ceiling,
                "Wait time extension refused"
            );
            return Err(Fault::Escalate(TransportError::WtxExceeded));
        };

        self.wtx.extension = total;
        self.statistics.wtx_requests += 1;
        // An unrepresentable deadline means the exchange no longer has one
        self.deadline = self.deadline.and_then(|deadline| deadline.checked_add(extension));
        debug!(multiplier, extension = ?extension, total = ?total, "Wait time extension granted");
        Ok(extension)
    }

    /// Clamp a wait to the exchange deadline
    fn wait_timeout(&self, timeout: Duration) -> Result<Duration, Fault> {
        let Some(deadline) = self.deadline else {
            return Ok(timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Fault::Escalate(TransportError::Timeout));
        }
        Ok(timeout.min(remaining))
    }

    /// Read one complete block into the receive frame and decode it
    fn receive_block(&mut self, timeout: Duration) -> Result<Inbound, Fault> {
        let codec = self.codec;
        self.rx_frame.clear();

        let head = self.rx_frame.reserve_tail(MIN_PROLOGUE).map_err(Fault::Escalate)?;
        read_exact(&mut self.link, head, timeout)?;
        let first = [head[0], head[1], head[2]];

        let extra = FrameCodec::extended_prologue(&first);
        if extra > 0 {
            let rest = self.rx_frame.reserve_tail(extra).map_err(Fault::Escalate)?;
            read_exact(&mut self.link, rest, timeout)?;
        }

        let body_len = codec
            .body_len(self.rx_frame.as_slice())
            .map_err(|e| Fault::Retry(e.into()))?;
        if self.rx_frame.len() + body_len > self.rx_frame.capacity() {
            debug!(body_len, "Discarding block larger than the receive frame");
            self.discard(body_len, timeout);
            return Err(Fault::Escalate(TransportError::Malformed(
                "block exceeds receive frame",
            )));
        }
        let body = self.rx_frame.reserve_tail(body_len).map_err(Fault::Escalate)?;
        read_exact(&mut self.link, body, timeout)?;

        self.statistics.blocks_received += 1;
        let raw = self.rx_frame.as_slice();
        trace!(block = %hex::encode(raw), "Received block");

        let block = match codec.decode(raw) {
            Ok(block) => block,
            Err(error) => {
                if matches!(error, FrameError::ChecksumMismatch { .. }) {
                    self.statistics.checksum_failures += 1;
                }
                debug!(%error, "Dropping invalid block");
                return Err(Fault::Retry(error.into()));
            }
        };

        let start = MIN_PROLOGUE + extra;
        Ok(Inbound {
            kind: block.kind,
            payload: start..start + block.payload.len(),
        })
    }

    /// Read and drop `remaining` bytes so the next read starts on a block
    /// boundary
    fn discard(&mut self, mut remaining: usize, timeout: Duration) {
        self.rx_frame.clear();
        let chunk_max = self.rx_frame.capacity();
        while remaining > 0 && chunk_max > 0 {
            let chunk = remaining.min(chunk_max);
            let Ok(scratch) = self.rx_frame.reserve_tail(chunk) else {
                break;
            };
            let drained = read_exact(&mut self.link, scratch, timeout);
            self.rx_frame.clear();
            if drained.is_err() {
                break;
            }
            remaining -= chunk;
        }
    }

    /// Write the staged command block
    fn transmit_command(&mut self) -> Result<(), Fault> {
        let frame = self.command_buffer.as_slice();
        trace!(block = %hex::encode(frame), "Sending block");
        self.statistics.blocks_sent += 1;
        write_all(&mut self.link, frame, self.config.block_timeout)?;
        Ok(())
    }

    /// Write an R- or S-block
    fn send_control(&mut self, block: &Block<'_>) -> Result<(), Fault> {
        let mut frame = [0u8; CONTROL_FRAME_MAX];
        let len = self
            .codec
            .encode_block(block, &mut frame)
            .map_err(|e| Fault::Escalate(e.into()))?;
        trace!(block = %hex::encode(&frame[..len]), "Sending block");
        self.statistics.blocks_sent += 1;
        write_all(&mut self.link, &frame[..len], self.config.block_timeout)?;
        Ok(())
    }
}

#[cfg(test)]
impl<L: Link> Session<L> {
    const fn sequence(&self) -> (crate::block::Seq, crate::block::Seq) {
        (self.send_seq, self.recv_seq)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{block::Seq, checksum::Checksum, config::T1Config, status::LinkStatus};

    /// Link answering every write with the next queued frame
    #[derive(Debug, Default)]
    struct EchoLink {
        replies: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl Link for EchoLink {
        fn open(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize, LinkError> {
            self.writes.push(bytes.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
            Ok(bytes.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, LinkError> {
            if self.pending.is_empty() {
                return Err(LinkError::Timeout);
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn close(&mut self) {}
    }

    fn peer() -> FrameCodec {
        FrameCodec::default().peer_view()
    }

    fn frame(block: &Block<'_>) -> Vec<u8> {
        peer().encode_to_vec(block).unwrap()
    }

    fn open_session(mut replies: VecDeque<Vec<u8>>) -> Session<EchoLink> {
        replies.push_front(frame(&peer().supervisory(SupervisoryKind::Resync, true, &[])));
        let link = EchoLink {
            replies,
            ..Default::default()
        };
        let config = T1Config::new().with_handshake(OpenHandshake::Resync);
        Session::connect(link, config).unwrap()
    }

    #[test]
    fn test_sequence_bits_follow_exchanges() {
        let response = |seq| {
            frame(&peer().block(
                BlockKind::Information { seq, more: false },
                &[0x90, 0x00],
            ))
        };
        let mut session = open_session(VecDeque::from([response(Seq::ZERO), response(Seq::ONE)]));

        assert_eq!(session.transceive(&[0x00, 0xA4]).unwrap(), &[0x90, 0x00]);
        assert_eq!(session.sequence(), (Seq::ONE, Seq::ONE));
        assert_eq!(session.transceive(&[0x00, 0xA4]).unwrap(), &[0x90, 0x00]);
        assert_eq!(session.sequence(), (Seq::ZERO, Seq::ZERO));
        assert_eq!(session.status(), LinkStatus::Idle);
    }

    #[test]
    fn test_ifs_request_is_answered() {
        let ifs = frame(&peer().supervisory(SupervisoryKind::Ifs, false, &[0x00, 0xFE]));
        let response = frame(&peer().block(
            BlockKind::Information {
                seq: Seq::ZERO,
                more: false,
            },
            &[0x90, 0x00],
        ));
        let mut session = open_session(VecDeque::from([ifs, response]));

        assert_eq!(session.transceive(&[0x80, 0x01]).unwrap(), &[0x90, 0x00]);
        let host = FrameCodec::default();
        let expected = host
            .encode_to_vec(&host.supervisory(SupervisoryKind::Ifs, true, &[0x00, 0xFE]))
            .unwrap();
        // The answer precedes the response block
        assert_eq!(session.link().writes.last().unwrap(), &expected);
    }

    #[test]
    fn test_zero_wtx_multiplier_is_nacked() {
        let mut wtx = frame(&peer().supervisory(SupervisoryKind::Wtx, false, &[0x01]));
        // Rewrite the multiplier to zero and fix the checksum
        wtx[3] = 0x00;
        let crc = Checksum::Crc16.compute(&wtx[..4]);
        Checksum::Crc16.write(crc, &mut wtx[4..]);
        let response = frame(&peer().block(
            BlockKind::Information {
                seq: Seq::ZERO,
                more: false,
            },
            &[0x90, 0x00],
        ));

        let mut session = open_session(VecDeque::from([wtx, response]));
        assert_eq!(session.transceive(&[0x80, 0x01]).unwrap(), &[0x90, 0x00]);
        let host = FrameCodec::default();
        let nack = host
            .encode_to_vec(&host.receive_ready(Seq::ZERO, ReadyError::Other))
            .unwrap();
        assert_eq!(session.link().writes.last().unwrap(), &nack);
        assert_eq!(session.statistics().retransmissions, 1);
    }
}
