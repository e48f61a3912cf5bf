//! HTTP server glue: accept, connection registry, deferred teardown.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::error;

use crate::errors::ServerError;
use crate::limits::{ReqLimits, RespLimits};
use crate::net::connection::TcpConn;
use crate::net::server::TcpServer;
use crate::reactor::{EventLoop, WatchClass};
use crate::router::Router;
use crate::server::connection::HttpConnection;

/// Ties the reactor, TCP listener, and router together. Each accepted
/// socket becomes an [`HttpConnection`] registered for read and hangup
/// events; when a connection finishes it is removed from the registry
/// and retired via the reactor's collector, never freed mid-callback.
pub struct HttpServer {
    eloop: Rc<EventLoop>,
    router: Rc<Router>,
    tcp: Rc<RefCell<TcpServer>>,
    connections: Rc<RefCell<HashMap<RawFd, Rc<RefCell<HttpConnection>>>>>,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl HttpServer {
    pub fn new(
        eloop: Rc<EventLoop>,
        router: Rc<Router>,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
    ) -> Rc<Self> {
        let tcp = TcpServer::new(eloop.clone());
        let server = Rc::new(Self {
            eloop,
            router,
            tcp: tcp.clone(),
            connections: Rc::new(RefCell::new(HashMap::new())),
            req_limits,
            resp_limits,
        });

        let hook = Rc::downgrade(&server);
        tcp.borrow_mut().set_accept_callback(Box::new(move |conn| {
            if let Some(server) = hook.upgrade() {
                server.on_accept(conn);
            }
        }));
        server
    }

    /// Binds and starts listening; accepted connections flow from here on.
    pub fn start(&self, host: &str, port: u16) -> Result<(), ServerError> {
        self.tcp.borrow_mut().start_listen(host, port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.borrow().local_addr()
    }

    /// Live connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    fn on_accept(&self, conn: TcpConn) {
        let fd = conn.fd();

        let eloop = self.eloop.clone();
        let connections = self.connections.clone();
        let on_finish = Box::new(move |fd: RawFd| {
            // The connection is likely finishing from inside its own
            // callback; park it on the collector instead of dropping it
            // here.
            if let Some(gone) = connections.borrow_mut().remove(&fd) {
                eloop.schedule_retire(gone);
            }
        });

        let connection = HttpConnection::new_rc(
            conn,
            self.router.clone(),
            self.eloop.clone(),
            self.req_limits.clone(),
            self.resp_limits.clone(),
            on_finish,
        );

        if let Err(e) = self
            .eloop
            .add_watch(fd, WatchClass::Read, connection.clone())
        {
            error!("fd {fd}: registration failed: {e}");
            return;
        }
        if let Err(e) = self
            .eloop
            .add_watch(fd, WatchClass::Hangup, connection.clone())
        {
            error!("fd {fd}: registration failed: {e}");
            return;
        }
        self.connections.borrow_mut().insert(fd, connection);
    }
}
