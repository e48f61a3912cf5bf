//! Non-blocking TCP connection wrapper.

use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::debug;

use crate::reactor::EventLoop;

/// One accepted socket, owned by its HTTP connection.
///
/// Reads and writes are thin non-blocking wrappers: every error,
/// `WouldBlock` included, propagates to the caller unchanged. Closing
/// removes all reactor watches for the descriptor first and is
/// idempotent.
pub struct TcpConn {
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: Option<SocketAddr>,
    eloop: Rc<EventLoop>,
}

impl TcpConn {
    pub(crate) fn new(stream: TcpStream, eloop: Rc<EventLoop>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream: Some(stream),
            fd,
            peer,
            eloop,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn write_data(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.write(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Streams up to `count` bytes of `file` straight to the socket via
    /// `sendfile(2)`, advancing the file's own cursor.
    pub fn send_file(&mut self, file: &File, count: usize) -> io::Result<usize> {
        if self.stream.is_none() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let sent = unsafe {
            libc::sendfile(self.fd, file.as_raw_fd(), std::ptr::null_mut(), count)
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    /// Removes every reactor watch for the descriptor, then closes it.
    /// A second close is a no-op.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("closing fd {}", self.fd);
            self.eloop.remove_fd(self.fd);
            drop(stream);
        }
    }
}

impl Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_vectored(bufs),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.close();
    }
}
