//! Per-socket HTTP orchestration.
//!
//! One [`HttpConnection`] binds the parser, the response FIFO, and the
//! router together for one accepted socket. Requests are handed to the
//! router the moment they finish parsing; their responses complete out
//! of order on container workers, but the FIFO guarantees they drain to
//! the socket strictly in request order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::http::parser::Parser;
use crate::http::request::Request;
use crate::http::response::{Response, SendState};
use crate::limits::{ReqLimits, RespLimits};
use crate::net::connection::TcpConn;
use crate::reactor::{EventLoop, FdHandler, Notifier, WatchClass};
use crate::router::Router;

/// Invoked exactly once when the connection finishes, so the owner can
/// drop its reference and retire the object through the collector.
pub type FinishCallback = Box<dyn Fn(RawFd)>;

pub struct HttpConnection {
    conn: TcpConn,
    fd: RawFd,
    parser: Parser,
    /// Pipelined (request, response) pairs in parse order; the front is
    /// always the next response allowed on the wire.
    pending: VecDeque<(Arc<Request>, Arc<Response>)>,
    router: Rc<Router>,
    eloop: Rc<EventLoop>,
    notifier: Notifier,
    self_ref: Weak<RefCell<HttpConnection>>,
    recv_buf: Vec<u8>,
    resp_limits: RespLimits,
    write_armed: bool,
    finished: bool,
    on_finish: FinishCallback,
}

impl HttpConnection {
    pub fn new_rc(
        conn: TcpConn,
        router: Rc<Router>,
        eloop: Rc<EventLoop>,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
        on_finish: FinishCallback,
    ) -> Rc<RefCell<Self>> {
        let fd = conn.fd();
        let notifier = eloop.notifier();
        let recv_buf = vec![0u8; req_limits.recv_buffer];
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                conn,
                fd,
                parser: Parser::new(req_limits),
                pending: VecDeque::new(),
                router,
                eloop,
                notifier,
                self_ref: self_ref.clone(),
                recv_buf,
                resp_limits,
                write_armed: false,
                finished: false,
                on_finish,
            })
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Pairs each newly parsed request with a response and dispatches it.
    fn dispatch_parsed(&mut self) {
        while let Some(request) = self.parser.take_request() {
            debug!(
                "fd {}: parsed {} {}",
                self.fd,
                request.method().as_str(),
                String::from_utf8_lossy(request.url_bytes())
            );
            let request = Arc::new(request);
            let response = Arc::new(Response::new(
                request.is_last(),
                Some((self.notifier.clone(), self.fd)),
            ));
            self.pending.push_back((request.clone(), response.clone()));
            self.router.serve(request, response);
        }
    }

    /// Drains the oldest pending response(s) to the socket.
    fn drain_responses(&mut self) {
        while let Some((_, response)) = self.pending.front() {
            match response.send(&mut self.conn, &self.resp_limits) {
                Ok(SendState::Done) => {
                    let last = response.is_last();
                    self.pending.pop_front();
                    if last {
                        debug!("fd {}: last response drained, closing", self.fd);
                        return self.finish();
                    }
                }
                Ok(SendState::Pending) => {
                    // Nothing new to write; the notifier will bring us
                    // back when the handler appends more.
                    self.disarm_write();
                    return;
                }
                Ok(SendState::Blocked) => {
                    self.arm_write();
                    return;
                }
                Err(e) => {
                    error!("fd {}: write failed: {e}", self.fd);
                    return self.finish();
                }
            }
        }
        self.disarm_write();
    }

    fn arm_write(&mut self) {
        if self.write_armed {
            return;
        }
        if let Some(handler) = self.self_ref.upgrade() {
            if self
                .eloop
                .add_watch(self.fd, WatchClass::Write, handler)
                .is_ok()
            {
                self.write_armed = true;
            }
        }
    }

    fn disarm_write(&mut self) {
        if !self.write_armed {
            return;
        }
        let _ = self.eloop.remove_watch(self.fd, WatchClass::Write);
        self.write_armed = false;
    }

    /// Closes the socket (removing all watches) and reports to the owner.
    /// Safe to reach from multiple paths; only the first call acts.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.conn.close();
        (self.on_finish)(self.fd);
    }
}

impl FdHandler for HttpConnection {
    fn on_readable(&mut self) {
        loop {
            match self.conn.read_data(&mut self.recv_buf) {
                Ok(0) => return self.finish(),
                Ok(n) => {
                    if let Err(e) = self.parser.append_data(&self.recv_buf[..n]) {
                        warn!("fd {}: parse failure: {e}", self.fd);
                        return self.finish();
                    }
                    self.dispatch_parsed();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("fd {}: read failed: {e}", self.fd);
                    return self.finish();
                }
            }
        }
    }

    fn on_writable(&mut self) {
        if !self.finished {
            self.drain_responses();
        }
    }

    fn on_hangup(&mut self) {
        debug!("fd {}: peer closed", self.fd);
        self.finish();
    }
}
