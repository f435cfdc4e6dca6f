//! I2C link
//!
//! While the secure element is processing it does not acknowledge its
//! address. Every transfer is retried every `poll_interval` until it is
//! acknowledged or the timeout passes.

use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use se05x_t1::{Link, LinkError};
use thiserror::Error;
use tracing::{debug, trace};

/// Default 7-bit address of SE05x devices
pub const DEFAULT_I2C_ADDRESS: u8 = 0x48;

/// Error reported by an I2C bus driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum I2cError {
    /// The device did not acknowledge its address
    #[error("Address not acknowledged")]
    Nack,

    /// Any other bus fault
    #[error("Bus error: {0}")]
    Bus(String),
}

/// Minimal blocking I2C master
pub trait I2cBus: fmt::Debug {
    /// Write `bytes` to the device at `address`
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), I2cError>;

    /// Fill `buf` from the device at `address`
    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), I2cError>;
}

/// Configuration options for an I2C link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cConfig {
    /// 7-bit device address
    pub address: u8,
    /// Delay between attempts while the device does not acknowledge
    pub poll_interval: Duration,
    /// Pause after every completed transfer
    pub guard_time: Duration,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_I2C_ADDRESS,
            poll_interval: Duration::from_millis(1),
            guard_time: Duration::from_micros(100),
        }
    }
}

impl I2cConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device address
    pub const fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    /// Set the polling interval
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the guard time
    pub const fn with_guard_time(mut self, guard_time: Duration) -> Self {
        self.guard_time = guard_time;
        self
    }
}

/// Link over an I2C bus
#[derive(Debug)]
pub struct I2cLink<B: I2cBus> {
    bus: B,
    config: I2cConfig,
    open: bool,
}

impl<B: I2cBus> I2cLink<B> {
    /// Create a closed link on `bus`
    pub const fn new(bus: B, config: I2cConfig) -> Self {
        Self {
            bus,
            config,
            open: false,
        }
    }

    /// Link configuration
    pub const fn config(&self) -> &I2cConfig {
        &self.config
    }

    /// The underlying bus
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// The underlying bus, mutably
    pub const fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Give back the bus
    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Run `transfer` until the device acknowledges or `timeout` passes
    fn poll(
        &mut self,
        timeout: Duration,
        mut transfer: impl FnMut(&mut B, u8) -> Result<(), I2cError>,
    ) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::Closed);
        }

        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match transfer(&mut self.bus, self.config.address) {
                Ok(()) => {
                    if attempts > 1 {
                        trace!(attempts, "Device acknowledged after polling");
                    }
                    if !self.config.guard_time.is_zero() {
                        thread::sleep(self.config.guard_time);
                    }
                    return Ok(());
                }
                Err(I2cError::Nack) => {
                    if start.elapsed() >= timeout {
                        debug!(attempts, ?timeout, "Device busy until timeout");
                        return Err(LinkError::Timeout);
                    }
                    thread::sleep(self.config.poll_interval);
                }
                Err(I2cError::Bus(message)) => return Err(LinkError::Bus(message)),
            }
        }
    }
}

impl<B: I2cBus> Link for I2cLink<B> {
    fn open(&mut self) -> Result<(), LinkError> {
        debug!(address = self.config.address, "Opening I2C link");
        self.open = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        self.poll(timeout, |bus, address| bus.write(address, bytes))?;
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        self.poll(timeout, |bus, address| bus.read(address, buf))?;
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Bus that refuses a number of transfers before answering
    #[derive(Debug, Default)]
    struct BusyBus {
        nacks: usize,
        attempts: usize,
        written: Vec<(u8, Vec<u8>)>,
        replies: VecDeque<u8>,
        fault: Option<String>,
    }

    impl BusyBus {
        fn transfer(&mut self) -> Result<(), I2cError> {
            self.attempts += 1;
            if let Some(fault) = &self.fault {
                return Err(I2cError::Bus(fault.clone()));
            }
            if self.nacks > 0 {
                self.nacks -= 1;
                return Err(I2cError::Nack);
            }
            Ok(())
        }
    }

    impl I2cBus for BusyBus {
        fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), I2cError> {
            self.transfer()?;
            self.written.push((address, bytes.to_vec()));
            Ok(())
        }

        fn read(&mut self, _address: u8, buf: &mut [u8]) -> Result<(), I2cError> {
            self.transfer()?;
            for slot in buf.iter_mut() {
                *slot = self.replies.pop_front().unwrap_or(0);
            }
            Ok(())
        }
    }

    fn config() -> I2cConfig {
        I2cConfig::new()
            .with_poll_interval(Duration::from_micros(10))
            .with_guard_time(Duration::ZERO)
    }

    #[test]
    fn test_polls_until_acknowledged() {
        let bus = BusyBus {
            nacks: 3,
            ..Default::default()
        };
        let mut link = I2cLink::new(bus, config());
        link.open().unwrap();

        let frame = hex::decode("5acf00377f").unwrap();
        assert_eq!(link.write(&frame, Duration::from_secs(1)).unwrap(), 5);
        assert_eq!(link.bus().attempts, 4);
        assert_eq!(link.bus().written, [(DEFAULT_I2C_ADDRESS, frame)]);
    }

    #[test]
    fn test_read_fills_buffer() {
        let bus = BusyBus {
            nacks: 1,
            replies: VecDeque::from(vec![0xA5, 0x82, 0x00]),
            ..Default::default()
        };
        let mut link = I2cLink::new(bus, config());
        link.open().unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(link.read(&mut buf, Duration::from_secs(1)).unwrap(), 3);
        assert_eq!(buf, [0xA5, 0x82, 0x00]);
    }

    #[test]
    fn test_busy_device_times_out() {
        let bus = BusyBus {
            nacks: usize::MAX,
            ..Default::default()
        };
        let mut link = I2cLink::new(bus, config());
        link.open().unwrap();

        assert_eq!(
            link.write(&[0x00], Duration::from_millis(5)),
            Err(LinkError::Timeout)
        );
        assert!(link.bus().attempts > 1);
    }

    #[test]
    fn test_bus_fault_is_reported() {
        let bus = BusyBus {
            fault: Some("arbitration lost".into()),
            ..Default::default()
        };
        let mut link = I2cLink::new(bus, config().with_address(0x49));
        link.open().unwrap();

        assert_eq!(
            link.write(&[0x00], Duration::from_millis(5)),
            Err(LinkError::Bus("arbitration lost".into()))
        );
        assert_eq!(link.bus().attempts, 1);
    }

    #[test]
    fn test_closed_link() {
        let mut link = I2cLink::new(BusyBus::default(), config());
        assert_eq!(
            link.write(&[0x00], Duration::from_millis(5)),
            Err(LinkError::Closed)
        );
        link.open().unwrap();
        link.close();
        assert_eq!(
            link.read(&mut [0u8; 1], Duration::from_millis(5)),
            Err(LinkError::Closed)
        );
        assert_eq!(link.bus().attempts, 0);
    }
}
