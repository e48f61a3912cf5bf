//! gantry - a plugin-hosting HTTP server core
//!
//! A single reactor thread multiplexes every socket: connections are
//! accepted, parsed with zero-copy byte ranges, and routed by URI prefix
//! to a [`Container`] — a dynamically loaded handler (or in-process
//! stand-in) running on its own worker thread behind a blocking hand-off
//! queue. Handlers build their [`Response`] at their own pace; the
//! reactor drains whatever is outstanding as sockets accept bytes, and
//! pipelined responses always leave in request order.
//!
//! # Architecture
//!
//! ```text
//! TcpServer ── accept ──▶ HttpConnection ── bytes ──▶ Parser
//!                              │                        │ request
//!                              │ FIFO pair              ▼
//!                              │◀────────────────── Router ── prefix ──▶ Container
//!                              │                                            │ queue
//!                              ▼                                            ▼
//!                        Response.send ◀── append_data ────────── worker thread
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::sync::Arc;
//! use gantry::{
//!     Config, Container, ContainerError, EventLoop, Handler, HttpServer,
//!     MatchMode, ReqLimits, RespLimits, Request, Response, Router,
//! };
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn serve(&mut self, _req: &Request, resp: &Response) -> Result<(), ContainerError> {
//!         resp.write_status_line(200)?;
//!         resp.write_header("Content-Type", "text/plain");
//!         resp.write_header("Content-Length", "13");
//!         resp.end_headers();
//!         resp.append_data(b"Hello, world!");
//!         resp.end_body();
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let eloop = Rc::new(EventLoop::new()?);
//!     let hello = Container::custom("hello", Box::new(Hello));
//!     hello.run(Arc::new(Config::new()))?;
//!
//!     let mut router = Router::new(MatchMode::First)?;
//!     router.bind("/", hello.clone())?;
//!
//!     let server = HttpServer::new(
//!         eloop.clone(),
//!         Rc::new(router),
//!         ReqLimits::default(),
//!         RespLimits::default(),
//!     );
//!     server.start("127.0.0.1", 8000)?;
//!     eloop.run()?;
//!     hello.shutdown();
//!     Ok(())
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod net {
    pub(crate) mod connection;
    pub(crate) mod server;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub mod config;
pub mod container;
pub mod errors;
pub mod limits;
pub mod reactor;
pub mod router;

pub use crate::{
    config::{Config, ParamKind, Value, CORE_SECTION},
    container::{Container, Handler, PluginDecl, QueueItem, SyncQueue, ABI_VERSION},
    errors::{ConfigError, ContainerError, HttpError, ServerError},
    http::{
        parser::Parser,
        request::{ByteRange, HeaderRange, Request, UrlField},
        response::{Response, SendState},
        types::{status_phrase, Method},
    },
    limits::{ReqLimits, RespLimits},
    net::{connection::TcpConn, server::TcpServer},
    reactor::{collector::Collector, EventLoop, FdHandler, Notifier, WatchClass},
    router::{MatchMode, Router, ROUTE_MAX_LEN},
    server::{connection::HttpConnection, server_impl::HttpServer},
};
