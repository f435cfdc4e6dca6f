//! Links carrying SE05x T=1 blocks
//!
//! - [`I2cLink`] talks to the secure element over any [`I2cBus`]
//!   implementation, polling while the device is busy
//! - [`SocketLink`] tunnels blocks to a remote proxy over TCP
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod i2c;
pub mod socket;

pub use i2c::{DEFAULT_I2C_ADDRESS, I2cBus, I2cConfig, I2cError, I2cLink};
pub use socket::{MESSAGE_BLOCK, SocketLink};
