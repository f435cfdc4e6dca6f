//! Answer to reset returned by the interface soft reset

use core::time::Duration;

use bytes::Bytes;

use crate::error::FrameError;

/// Physical layer identifier for I2C
pub const PHYSICAL_LAYER_I2C: u8 = 0x02;

/// Parsed answer to reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    /// Protocol version
    pub protocol_version: u8,
    /// Registered application provider identifier
    pub vendor_id: [u8; 5],
    /// Block waiting time
    pub block_waiting_time: Duration,
    /// Largest information field the secure element accepts
    pub ifsc: u16,
    /// Physical layer identifier
    pub physical_layer: u8,
    /// Maximum bus clock in kHz
    pub max_clock_khz: u16,
    /// Physical layer configuration flags
    pub config: u8,
    /// Minimum polling time
    pub min_polling_time: Duration,
    /// Secure element guard time
    pub guard_time: Duration,
    /// Wake-up time
    pub wake_up_time: Duration,
    /// Historical bytes
    pub historical_bytes: Bytes,
}

impl Atr {
    /// Parse the payload of an interface soft reset response
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader { data };

        let protocol_version = reader.u8()?;
        let mut vendor_id = [0; 5];
        vendor_id.copy_from_slice(reader.take(5)?);

        let mut link = Reader {
            data: reader.prefixed()?,
        };
        let block_waiting_time = Duration::from_millis(link.u16()?.into());
        let ifsc = link.u16()?;

        let physical_layer = reader.u8()?;
        let mut physical = Reader {
            data: reader.prefixed()?,
        };
        let max_clock_khz = physical.u16()?;
        let config = physical.u8()?;
        let min_polling_time = Duration::from_millis(physical.u8()?.into());
        physical.take(3)?;
        let guard_time = Duration::from_micros(physical.u16()?.into());
        let wake_up_time = Duration::from_micros(physical.u16()?.into());

        let historical_bytes = Bytes::copy_from_slice(reader.prefixed()?);

        Ok(Self {
            protocol_version,
            vendor_id,
            block_waiting_time,
            ifsc,
            physical_layer,
            max_clock_khz,
            config,
            min_polling_time,
            guard_time,
            wake_up_time,
            historical_bytes,
        })
    }

    /// Whether the secure element reported an I2C physical layer
    pub const fn is_i2c(&self) -> bool {
        self.physical_layer == PHYSICAL_LAYER_I2C
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.data.len() < n {
            return Err(FrameError::Malformed("truncated ATR"));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.u8()?;
        self.take(len.into())
    }
}
