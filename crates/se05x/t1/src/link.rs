//! Physical link abstraction

use alloc::boxed::Box;
use core::{fmt, time::Duration};

use crate::error::LinkError;

/// Byte transport between host and secure element
///
/// A link moves whole blocks or parts of them. Reads may return fewer bytes
/// than requested; the session keeps reading until the block is complete.
pub trait Link: fmt::Debug {
    /// Bring the link up
    fn open(&mut self) -> Result<(), LinkError>;

    /// Write `bytes`, returning how many were accepted
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Read into `buf`, returning how many bytes arrived
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Release the link
    fn close(&mut self);
}

impl<T: Link + ?Sized> Link for &mut T {
    fn open(&mut self) -> Result<(), LinkError> {
        (**self).open()
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        (**self).write(bytes, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        (**self).read(buf, timeout)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

impl<T: Link + ?Sized> Link for Box<T> {
    fn open(&mut self) -> Result<(), LinkError> {
        (**self).open()
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        (**self).write(bytes, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        (**self).read(buf, timeout)
    }

    fn close(&mut self) {
        (**self).close();
    }
}
