//! TCP link to a remote proxy that owns the physical secure element
//!
//! Every message on the stream is
//!
//! ```text
//! | type (1) | length (2, big endian) | bytes (length) |
//! ```
//!
//! Type [`MESSAGE_BLOCK`] carries block bytes in both directions.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use se05x_t1::{Link, LinkError};
use tracing::{debug, trace, warn};

/// Message type carrying T=1 block bytes
pub const MESSAGE_BLOCK: u8 = 0x01;

const HEADER_LEN: usize = 3;
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// Link to a remote proxy over TCP
#[derive(Debug)]
pub struct SocketLink {
    address: SocketAddr,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    /// Bytes of the last message not yet handed to the reader
    pending: VecDeque<u8>,
}

impl SocketLink {
    /// Create a closed link to `address`
    pub const fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connect_timeout: Duration::from_secs(5),
            stream: None,
            pending: VecDeque::new(),
        }
    }

    /// Resolve `address` (for example `"localhost:8050"`) and create a link
    pub fn resolve(address: &str) -> Result<Self, LinkError> {
        let address = address
            .to_socket_addrs()
            .map_err(|e| LinkError::bus(format!("Invalid proxy address {address}: {e}")))?
            .next()
            .ok_or_else(|| LinkError::bus(format!("No address found for {address}")))?;
        Ok(Self::new(address))
    }

    /// Set the timeout for establishing the connection
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Proxy address
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether the connection is established
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut TcpStream, LinkError> {
        self.stream.as_mut().ok_or(LinkError::Closed)
    }

    /// Drop the connection and anything buffered from it
    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(address = %self.address, "Closing proxy connection");
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pending.clear();
    }

    /// Receive one message and queue its bytes
    ///
    /// Once the first byte of a message has arrived the rest must follow
    /// within `timeout`. A message cut short leaves the stream out of step
    /// with the proxy, so the connection is dropped.
    fn receive_message(&mut self, timeout: Duration) -> Result<(), LinkError> {
        let mut header = [0u8; HEADER_LEN];
        let first = {
            let stream = self.stream()?;
            stream
                .set_read_timeout(Some(timeout.max(MIN_IO_TIMEOUT)))
                .map_err(io_error)?;
            stream.read(&mut header[..1])
        };
        match first {
            Ok(0) => {
                self.disconnect();
                return Err(LinkError::Closed);
            }
            Ok(_) => {}
            Err(error) => return Err(io_error(error)),
        }

        let rest = {
            let stream = self.stream()?;
            read_rest(stream, &mut header)
        };
        let body = match rest {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "Proxy message cut short, dropping connection");
                self.disconnect();
                return Err(LinkError::bus(format!("truncated proxy message: {error}")));
            }
        };

        let kind = header[0];
        trace!(kind, bytes = %hex::encode(&body), "Received proxy message");
        if kind != MESSAGE_BLOCK {
            warn!(kind, "Unexpected proxy message type");
            return Err(LinkError::bus(format!("unexpected message type {kind:#04x}")));
        }
        self.pending.extend(body);
        Ok(())
    }
}

/// Read the rest of a message whose first header byte is in `header`
fn read_rest(stream: &mut TcpStream, header: &mut [u8; HEADER_LEN]) -> io::Result<Vec<u8>> {
    stream.read_exact(&mut header[1..])?;
    let len = usize::from(u16::from_be_bytes([header[1], header[2]]));
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn io_error(error: io::Error) -> LinkError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LinkError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => LinkError::Closed,
        _ => LinkError::Bus(error.to_string()),
    }
}

impl Link for SocketLink {
    fn open(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!(address = %self.address, "Connecting to proxy");
        let stream = TcpStream::connect_timeout(&self.address, self.connect_timeout)
            .map_err(|e| LinkError::bus(format!("Failed to connect to {}: {e}", self.address)))?;
        stream.set_nodelay(true).map_err(io_error)?;
        self.pending.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| LinkError::bus("block too large for proxy message"))?;

        let mut message = Vec::with_capacity(HEADER_LEN + bytes.len());
        message.push(MESSAGE_BLOCK);
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(bytes);

        let stream = self.stream()?;
        stream
            .set_write_timeout(Some(timeout.max(MIN_IO_TIMEOUT)))
            .map_err(io_error)?;
        stream.write_all(&message).map_err(io_error)?;
        trace!(bytes = %hex::encode(bytes), "Sent proxy message");
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if self.pending.is_empty() {
            self.receive_message(timeout)?;
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.disconnect();
    }
}
