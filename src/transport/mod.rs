//! Non-blocking transport seam.
//!
//! The engine never blocks: a transport either accepts some bytes or reports
//! [`io::ErrorKind::WouldBlock`], the driver then waits for writability and re-enters the
//! session.
use std::io::{self, IoSlice};
use std::time::Duration;

use crate::buf::File;

#[cfg(test)]
pub(crate) mod mock;

/// Connection level output and timer facility.
pub trait Transport: Send {
    /// Vectored write of the gathered buffers, returns bytes accepted.
    ///
    /// The slices are already cut to the current send limit.
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Write `len` bytes of `file` starting at `offset`, returns bytes accepted.
    fn send_file(&mut self, file: &File, offset: u64, len: u64) -> io::Result<usize>;

    /// Arm the connection write timer, replacing the previous one.
    fn add_timer(&mut self, delay: Duration);

    /// Disarm the connection write timer.
    fn del_timer(&mut self);

    /// Output is buffered below the engine, e.g. by an encryption layer.
    #[inline]
    fn lowlevel_buffered(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    #[inline]
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        T::send(self, bufs)
    }

    #[inline]
    fn send_file(&mut self, file: &File, offset: u64, len: u64) -> io::Result<usize> {
        T::send_file(self, file, offset, len)
    }

    #[inline]
    fn add_timer(&mut self, delay: Duration) {
        T::add_timer(self, delay)
    }

    #[inline]
    fn del_timer(&mut self) {
        T::del_timer(self)
    }

    #[inline]
    fn lowlevel_buffered(&self) -> bool {
        T::lowlevel_buffered(self)
    }
}
