//! Request and response processing limits.
//!
//! Defaults are intentionally conservative: a connection can never make the
//! server buffer more than one request head plus one declared body, and a
//! single client cannot hold a connection open for more than
//! [`max_pipelined`](ReqLimits::max_pipelined) requests.
//!
//! # Memory consumption
//!
//! Each active connection owns one receive buffer of
//! [`recv_buffer`](ReqLimits::recv_buffer) bytes plus the parser's growable
//! head buffer, which is trimmed back every time a request head is handed
//! over to its [`Request`](crate::Request).

/// Limits applied while parsing incoming requests.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum number of headers per request (default: `128`).
    ///
    /// The 129th header line is a hard parse failure and tears the
    /// connection down.
    pub header_count: usize,

    /// Maximum declared `Content-Length` in bytes (default: `1 MiB`).
    pub body_size: usize,

    /// Maximum number of pipelined requests served on one connection
    /// (default: `100`).
    ///
    /// The request that reaches this count is flagged "last" and the
    /// connection closes once its response is drained.
    pub max_pipelined: usize,

    /// Size of the per-connection receive buffer in bytes (default: `80 KiB`).
    pub recv_buffer: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            header_count: 128,
            body_size: 1024 * 1024,
            max_pipelined: 100,
            recv_buffer: 80 * 1024,
        }
    }
}

/// Limits applied while draining responses.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Maximum number of chunks handed to one vectored write (default: `64`).
    ///
    /// Chunk storage itself grows without bound; this only caps how many
    /// `iovec` entries a single `writev` sees, well under `IOV_MAX` on
    /// every supported platform.
    pub writev_batch: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self { writev_batch: 64 }
    }
}
