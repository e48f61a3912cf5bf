//! URI-prefix router.
//!
//! Bindings are scanned with a byte-wise common-prefix comparison against
//! the request's full target; a binding matches when the common prefix
//! covers its whole route. Two policies decide among multiple matches:
//!
//! - [`MatchMode::First`]: the first matching binding in bind order wins.
//! - [`MatchMode::Longest`]: every binding is scanned and the *last*
//!   matching binding in bind order wins. Note this does not compare
//!   match lengths — the name is historical, and the tests pin the
//!   literal behavior.

use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::container::{Container, Handler};
use crate::errors::{ContainerError, ServerError};
use crate::http::request::Request;
use crate::http::response::Response;

/// Routes longer than this are refused at bind time.
pub const ROUTE_MAX_LEN: usize = 256;

/// Routes shorter than this live inline in the binding, avoiding a heap
/// allocation for the common short-prefix case.
const ROUTE_INLINE_LEN: usize = 16;

enum RouteStr {
    Inline { len: u8, buf: [u8; ROUTE_INLINE_LEN] },
    Heap(Box<str>),
}

impl RouteStr {
    fn new(route: &str) -> Self {
        if route.len() < ROUTE_INLINE_LEN {
            let mut buf = [0u8; ROUTE_INLINE_LEN];
            buf[..route.len()].copy_from_slice(route.as_bytes());
            RouteStr::Inline {
                len: route.len() as u8,
                buf,
            }
        } else {
            RouteStr::Heap(route.into())
        }
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        match self {
            RouteStr::Inline { len, buf } => &buf[..*len as usize],
            RouteStr::Heap(route) => route.as_bytes(),
        }
    }
}

struct RouteBinding {
    route: RouteStr,
    container: Arc<Container>,
}

/// Policy for choosing among multiple matching bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    First,
    Longest,
}

pub struct Router {
    bindings: Vec<RouteBinding>,
    mode: MatchMode,
    default_container: Option<Arc<Container>>,
    null: Arc<Container>,
}

impl Router {
    /// Builds a router with its built-in null container already running.
    /// The null container is the only container the router owns.
    pub fn new(mode: MatchMode) -> Result<Self, ContainerError> {
        let null = Container::custom("null", Box::new(NullHandler));
        null.run(Arc::new(Config::new()))?;
        Ok(Self {
            bindings: Vec::new(),
            mode,
            default_container: None,
            null,
        })
    }

    /// Appends a binding. Bind order is significant for both match
    /// policies; route strings are immutable for the binding's lifetime.
    pub fn bind(&mut self, route: &str, container: Arc<Container>) -> Result<(), ServerError> {
        if route.len() > ROUTE_MAX_LEN {
            return Err(ServerError::RouteTooLong {
                route: route.to_string(),
                limit: ROUTE_MAX_LEN,
            });
        }
        self.bindings.push(RouteBinding {
            route: RouteStr::new(route),
            container,
        });
        Ok(())
    }

    /// Designates a container served unconditionally, before any prefix
    /// matching. The router does not own it.
    pub fn set_default_container(&mut self, container: Arc<Container>) {
        self.default_container = Some(container);
    }

    /// Hands the pair to the matching container's queue. Never blocks.
    pub fn serve(&self, request: Arc<Request>, response: Arc<Response>) {
        if let Some(default) = &self.default_container {
            default.serve(request, response);
            return;
        }

        let url = request.url_bytes();
        let mut chosen: Option<&Arc<Container>> = None;

        for binding in &self.bindings {
            let route = binding.route.as_bytes();
            if common_prefix_len(route, url) >= route.len() {
                chosen = Some(&binding.container);
                if self.mode == MatchMode::First {
                    break;
                }
                // Longest mode keeps scanning; the last match in bind
                // order is the one that sticks.
            }
        }

        match chosen {
            Some(container) => container.serve(request, response),
            None => {
                warn!(
                    "no container bound for {}",
                    String::from_utf8_lossy(url)
                );
                self.null.serve(request, response);
            }
        }
    }
}

/// Length of the shared prefix, scanning at most the shorter operand.
#[inline]
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Answers requests no binding claimed: log the miss, serve the failure
/// page. Serving (rather than erroring) keeps the null worker alive for
/// the next miss.
struct NullHandler;

impl Handler for NullHandler {
    fn serve(&mut self, request: &Request, response: &Response) -> Result<(), ContainerError> {
        warn!(
            "null container serving unmatched {}",
            String::from_utf8_lossy(request.url_bytes())
        );
        response.write_error(404)?;
        Ok(())
    }
}
