//! Listening TCP socket registered with the reactor.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use crate::errors::ServerError;
use crate::net::connection::TcpConn;
use crate::reactor::{EventLoop, FdHandler, WatchClass};

const BACKLOG: i32 = 1024;

pub type AcceptCallback = Box<dyn Fn(TcpConn)>;

/// Accepts inbound connections and hands each to the accept callback
/// wrapped in a [`TcpConn`]. Construction binds nothing; the socket is
/// created by [`start_listen`](TcpServer::start_listen).
pub struct TcpServer {
    eloop: Rc<EventLoop>,
    self_ref: Weak<RefCell<TcpServer>>,
    listener: Option<TcpListener>,
    accept_callback: Option<AcceptCallback>,
}

impl TcpServer {
    pub fn new(eloop: Rc<EventLoop>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                eloop,
                self_ref: self_ref.clone(),
                listener: None,
                accept_callback: None,
            })
        })
    }

    pub fn set_accept_callback(&mut self, callback: AcceptCallback) {
        self.accept_callback = Some(callback);
    }

    /// The bound address, once listening. With port 0 this is where the
    /// kernel actually put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Resolves `host:port`, builds a reuse-address non-blocking listener,
    /// and registers the accept watch on the reactor.
    pub fn start_listen(&mut self, host: &str, port: u16) -> Result<(), ServerError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| ServerError::sys("getaddrinfo", e))?
            .next()
            .ok_or_else(|| {
                ServerError::sys(
                    "getaddrinfo",
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address"),
                )
            })?;

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::sys("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::sys("setsockopt", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::sys("fcntl", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::sys("bind", e))?;
        socket
            .listen(BACKLOG)
            .map_err(|e| ServerError::sys("listen", e))?;

        let listener: TcpListener = socket.into();
        let fd = listener.as_raw_fd();
        self.listener = Some(listener);

        let handler = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ServerError::sys("listen", io::ErrorKind::NotFound.into()))?;
        self.eloop.add_watch(fd, WatchClass::Read, handler)?;

        debug!("listening on fd {fd}");
        Ok(())
    }
}

impl FdHandler for TcpServer {
    fn on_readable(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    match TcpConn::new(stream, self.eloop.clone()) {
                        Ok(conn) => match &self.accept_callback {
                            Some(callback) => callback(conn),
                            None => debug!("no accept callback, dropping {peer}"),
                        },
                        Err(e) => error!("fcntl failed on accepted socket: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.eloop.remove_fd(listener.as_raw_fd());
        }
    }
}
