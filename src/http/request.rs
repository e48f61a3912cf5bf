//! Parsed HTTP request with zero-copy field access.
//!
//! A [`Request`] owns the raw bytes of its message (head handed over from
//! the parser buffer at headers-complete, body appended afterwards); every
//! field — URL, URL sub-fields, header pairs, body — is a [`ByteRange`]
//! into that buffer. Ranges are plain offsets, so a `Request` is `Send`
//! and can cross into a container's worker thread as-is.

use crate::http::types::Method;

/// An `{offset, length}` view into a request's owned buffer.
///
/// Never independently allocated; only meaningful together with the
/// buffer it indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: usize,
    pub length: usize,
}

impl ByteRange {
    #[inline]
    pub(crate) const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Components of a request URL, in the order they appear in an
/// absolute-form target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlField {
    Scheme = 0,
    Userinfo = 1,
    Host = 2,
    Port = 3,
    Path = 4,
    Query = 5,
    Fragment = 6,
}

pub(crate) const URL_FIELD_COUNT: usize = 7;

/// One header's key and value ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderRange {
    pub key: ByteRange,
    pub value: ByteRange,
}

/// A fully parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    pub(crate) buffer: Vec<u8>,

    pub(crate) method: Method,
    pub(crate) url: ByteRange,
    pub(crate) url_fields: [Option<ByteRange>; URL_FIELD_COUNT],

    pub(crate) headers: Vec<HeaderRange>,
    pub(crate) content_length: usize,
    pub(crate) body: Option<ByteRange>,

    pub(crate) last: bool,
}

impl Request {
    pub(crate) fn new(method: Method) -> Self {
        Self {
            buffer: Vec::new(),
            method,
            url: ByteRange::default(),
            url_fields: [None; URL_FIELD_COUNT],
            headers: Vec::new(),
            content_length: 0,
            body: None,
            last: false,
        }
    }

    /// Resolves a range against this request's buffer.
    ///
    /// Out-of-bounds ranges yield an empty slice rather than a panic;
    /// every range produced by the parser is in bounds by construction.
    #[inline]
    pub fn slice(&self, range: ByteRange) -> &[u8] {
        self.buffer
            .get(range.offset..range.end())
            .unwrap_or_default()
    }

    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The full request target as it appeared on the request line,
    /// query string included.
    #[inline]
    pub fn url_bytes(&self) -> &[u8] {
        self.slice(self.url)
    }

    #[inline]
    pub const fn url_range(&self) -> ByteRange {
        self.url
    }

    /// One URL component, if the target carried it.
    #[inline]
    pub fn url_field(&self, field: UrlField) -> Option<&[u8]> {
        self.url_fields[field as usize].map(|r| self.slice(r))
    }

    /// The path component, falling back to the whole target for
    /// asterisk-form requests.
    #[inline]
    pub fn path(&self) -> &[u8] {
        self.url_field(UrlField::Path).unwrap_or(self.url_bytes())
    }

    /// Iterates header `(key, value)` pairs in wire order.
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.headers
            .iter()
            .map(|h| (self.slice(h.key), self.slice(h.value)))
    }

    /// First header value whose key matches `name` case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| self.slice(h.key).eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| self.slice(h.value))
    }

    /// Declared `Content-Length`, zero when absent.
    #[inline]
    pub const fn content_length(&self) -> usize {
        self.content_length
    }

    #[inline]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.map(|r| self.slice(r))
    }

    /// Whether the connection must close after this request's response.
    #[inline]
    pub const fn is_last(&self) -> bool {
        self.last
    }
}
