use std::io;

use thiserror::Error;

/// Protocol-level failures raised while parsing a request or building a
/// response. Any of these on the parse path is fatal for the offending
/// connection and for that connection only.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid HTTP method")]
    InvalidMethod,

    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid URL")]
    InvalidUrl,

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("invalid header line")]
    InvalidHeader,

    #[error("too many headers (limit {0})")]
    TooManyHeaders(usize),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("request body too large (limit {0})")]
    BodyTooLarge(usize),

    #[error("request head is not valid UTF-8")]
    InvalidEncoding,

    #[error("unknown status code {0}")]
    UnknownStatusCode(u16),
}

/// Container construction and plugin lifecycle failures.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to load plugin {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin {path} does not export PLUGIN_DECL: {source}")]
    MissingDecl {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin ABI version {found} does not match host version {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("container worker is already running")]
    AlreadyRunning,

    /// Free-form failure reported by a plugin's own lifecycle code.
    #[error("{0}")]
    Plugin(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration store failures (see [`crate::config::Config`]).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option {section}.{name}")]
    UnknownOption { section: String, name: String },

    #[error("option {section}.{name} is already registered")]
    DuplicateOption { section: String, name: String },

    #[error("type mismatch for option {section}.{name}")]
    TypeMismatch { section: String, name: String },

    #[error("option {section}.{name} is not multivalued")]
    NotMultivalued { section: String, name: String },

    #[error("no value for {section}.{name}[{index}]")]
    Missing {
        section: String,
        name: String,
        index: usize,
    },

    #[error("malformed configuration: {0}")]
    Parse(String),
}

/// Top-level error for server construction and the reactor loop.
///
/// System-call failures carry the name of the failing call so log lines
/// read like the OS diagnostics they stand in for.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("route {route:?} is too long (limit {limit})")]
    RouteTooLong { route: String, limit: usize },

    #[error("{call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    #[inline]
    pub(crate) fn sys(call: &'static str, source: io::Error) -> Self {
        ServerError::Sys { call, source }
    }
}
