//! APDU level transport trait
//!
//! A transport moves complete command and response APDUs. It has no
//! knowledge of command structure or secure channels.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{error::TransportError, link::Link, session::Session};

/// Trait for transports carrying raw APDU bytes
pub trait ApduTransport: fmt::Debug {
    /// Error type returned by the transport
    type Error: fmt::Debug;

    /// Send raw APDU bytes and return the response bytes
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Self::Error> {
        trace!(command = %hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = %hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Transmission implemented by each transport
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Self::Error>;

    /// Whether the transport can currently exchange APDUs
    fn is_connected(&self) -> bool;

    /// Reset the connection
    fn reset(&mut self) -> Result<(), Self::Error>;
}

impl<L: Link> ApduTransport for Session<L> {
    type Error = TransportError;

    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.transceive(command).map(Bytes::copy_from_slice)
    }

    fn is_connected(&self) -> bool {
        self.status().is_open()
    }

    /// Soft reset an open session, reopen a closed one
    fn reset(&mut self) -> Result<(), TransportError> {
        if self.status().is_open() {
            self.soft_reset()
        } else {
            self.open()
        }
    }
}
