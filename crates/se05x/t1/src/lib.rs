//! T=1 block transport for NXP SE05x secure elements
//!
//! This crate implements the host side of the inter-chip protocol that SE05x
//! devices speak over I2C, a variant of ISO/IEC 7816-3 T=1.
//!
//! ## Overview
//!
//! - [`FrameCodec`] encodes and decodes blocks and splits long APDUs into
//!   chained I-blocks
//! - [`Session`] owns a [`Link`] and drives the block exchange: acknowledgement,
//!   retransmission, wait time extension and resynchronisation
//! - [`ApduTransport`] exposes a session as a plain APDU pipe
//!
//! Concrete links live in the `se05x-link` crate.
//!
//! ## Features
//!
//! - `std` (default): [`Session`] and [`ApduTransport`], which need a clock
//!   and thread sleep. Without it the crate is `no_std` + `alloc` and offers
//!   the codec, checksums, ATR parsing, configuration and the [`Link`] trait.
//!
//! ```no_run
//! use se05x_t1::prelude::*;
//!
//! fn select<L: Link>(link: L) -> Result<(), TransportError> {
//!     let mut session = Session::connect(link, T1Config::default())?;
//!     let response = session.transceive(&[0x00, 0xA4, 0x04, 0x00, 0x00])?;
//!     println!("{}", hex::encode(response));
//!     Ok(())
//! }
//! ```
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

extern crate alloc;

pub use bytes::Bytes;

pub mod atr;
pub mod block;
pub mod buffer;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
#[cfg(feature = "std")]
pub mod session;
pub mod status;
#[cfg(feature = "std")]
pub mod transport;

pub use atr::Atr;
pub use block::{
    Block, BlockKind, MAX_BLOCK_PAYLOAD, NAD_HOST_TO_SE, NAD_SE_TO_HOST, ReadyError,
    SHORT_LEN_MAX, Seq, SupervisoryKind,
};
pub use checksum::Checksum;
pub use codec::{Chain, FrameCodec};
pub use config::{OpenHandshake, T1Config};
pub use error::{ConfigError, FrameError, LinkError, Result, TransportError};
pub use link::Link;
#[cfg(feature = "std")]
pub use session::{Session, Statistics};
pub use status::LinkStatus;
#[cfg(feature = "std")]
pub use transport::ApduTransport;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Atr, Bytes, Checksum, Link, LinkError, LinkStatus, OpenHandshake, T1Config, TransportError,
    };
    #[cfg(feature = "std")]
    pub use crate::{ApduTransport, Session};
}
