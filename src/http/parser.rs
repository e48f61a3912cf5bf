//! Incremental HTTP/1.1 request parser.
//!
//! Bytes arrive in arbitrary slices via [`Parser::append_data`]; the
//! tokenizer resumes exactly where the previous call stopped, so the
//! sequence of parsed requests is independent of chunk boundaries. Field
//! extraction is zero-copy: the parser records byte ranges, and at
//! headers-complete the consumed prefix of its buffer is moved out into
//! the finished [`Request`] — the parser keeps only the unconsumed
//! remainder, which bounds memory on long-lived pipelined connections.
//!
//! Completed requests queue up in arrival order and are taken with
//! [`Parser::take_request`].

use std::collections::VecDeque;

use memchr::{memchr, memrchr};

use crate::errors::HttpError;
use crate::http::request::{ByteRange, HeaderRange, Request, UrlField, URL_FIELD_COUNT};
use crate::http::types::Method;
use crate::limits::ReqLimits;

#[derive(Debug)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: usize },
}

pub struct Parser {
    buf: Vec<u8>,
    /// First byte not yet examined by the newline scan.
    scan: usize,
    line_start: usize,
    state: State,

    current: Option<Request>,
    /// True when the message's version defaults to close (HTTP/1.0) and
    /// no `Connection` header has overridden it yet.
    close_by_default: bool,
    connection_close: Option<bool>,
    content_length: usize,

    done: VecDeque<Request>,
    parsed: usize,

    limits: ReqLimits,
}

impl Parser {
    pub fn new(limits: ReqLimits) -> Self {
        Self {
            buf: Vec::new(),
            scan: 0,
            line_start: 0,
            state: State::RequestLine,
            current: None,
            close_by_default: false,
            connection_close: None,
            content_length: 0,
            done: VecDeque::new(),
            parsed: 0,
            limits,
        }
    }

    /// Feeds one chunk of raw connection bytes through the tokenizer.
    ///
    /// A hard parse failure poisons the connection: the caller must stop
    /// feeding this parser and tear the connection down.
    pub fn append_data(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if data.is_empty() {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        self.advance()
    }

    /// Next fully parsed request, in arrival order.
    #[inline]
    pub fn take_request(&mut self) -> Option<Request> {
        self.done.pop_front()
    }

    /// Messages completed on this connection so far.
    #[inline]
    pub fn parsed_count(&self) -> usize {
        self.parsed
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn advance(&mut self) -> Result<(), HttpError> {
        loop {
            match self.state {
                State::RequestLine => {
                    let Some(nl) = self.next_newline() else {
                        return Ok(());
                    };
                    if !self.consume_request_line(nl)? {
                        continue;
                    }
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(nl) = self.next_newline() else {
                        return Ok(());
                    };
                    let content = self.line_content(nl)?;
                    if content.length == 0 {
                        self.finish_headers(nl)?;
                    } else {
                        self.consume_header_line(content)?;
                        self.step_past(nl);
                    }
                }
                State::Body { remaining } => {
                    let take = remaining.min(self.buf.len());
                    if take > 0 {
                        let current = self
                            .current
                            .as_mut()
                            .ok_or(HttpError::InvalidRequestLine)?;
                        current.buffer.extend_from_slice(&self.buf[..take]);
                        self.buf.drain(..take);
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = State::Body { remaining };
                        return Ok(());
                    }
                    self.finish_message();
                }
            }
        }
    }

    /// Index of the next `\n` at or after `scan`, or `None` with the scan
    /// cursor parked at the end of the buffer.
    fn next_newline(&mut self) -> Option<usize> {
        match memchr(b'\n', &self.buf[self.scan..]) {
            Some(i) => Some(self.scan + i),
            None => {
                self.scan = self.buf.len();
                None
            }
        }
    }

    /// The line body between `line_start` and `nl`, CRLF excluded.
    /// Bare `\n` line endings are rejected.
    fn line_content(&self, nl: usize) -> Result<ByteRange, HttpError> {
        if nl == self.line_start || self.buf[nl - 1] != b'\r' {
            return Err(HttpError::InvalidHeader);
        }
        Ok(ByteRange::new(self.line_start, nl - 1 - self.line_start))
    }

    #[inline]
    fn step_past(&mut self, nl: usize) {
        self.line_start = nl + 1;
        self.scan = nl + 1;
    }

    /// Returns `false` for a tolerated empty prologue line (skipped and
    /// trimmed so the message still starts at buffer offset zero).
    fn consume_request_line(&mut self, nl: usize) -> Result<bool, HttpError> {
        debug_assert_eq!(self.line_start, 0);

        if nl >= 1 && self.buf[nl - 1] == b'\r' && nl == 1 {
            // Empty line between pipelined messages; RFC 9112 asks
            // servers to skip at least one.
            self.buf.drain(..2);
            self.scan = 0;
            self.line_start = 0;
            return Ok(false);
        }

        let content = match self.line_content(nl) {
            Ok(c) => c,
            Err(_) => return Err(HttpError::InvalidRequestLine),
        };
        let line = &self.buf[content.offset..content.end()];

        let sp1 = memchr(b' ', line).ok_or(HttpError::InvalidRequestLine)?;
        let method = Method::from_bytes(&line[..sp1])?;

        let rest = &line[sp1 + 1..];
        let sp2 = memrchr(b' ', rest).ok_or(HttpError::InvalidRequestLine)?;
        let url = &rest[..sp2];
        let version = &rest[sp2 + 1..];

        if url.is_empty() || memchr(b' ', url).is_some() {
            return Err(HttpError::InvalidUrl);
        }
        self.close_by_default = match version {
            b"HTTP/1.1" => false,
            b"HTTP/1.0" => true,
            _ => return Err(HttpError::UnsupportedVersion),
        };

        let url_range = ByteRange::new(sp1 + 1, url.len());
        let mut request = Request::new(method);
        request.url = url_range;
        parse_url_fields(url, url_range.offset, &mut request.url_fields)?;

        self.current = Some(request);
        self.connection_close = None;
        self.content_length = 0;
        self.step_past(nl);
        Ok(true)
    }

    fn consume_header_line(&mut self, content: ByteRange) -> Result<(), HttpError> {
        let line = &self.buf[content.offset..content.end()];
        let current = self.current.as_mut().ok_or(HttpError::InvalidHeader)?;

        if current.headers.len() >= self.limits.header_count {
            return Err(HttpError::TooManyHeaders(self.limits.header_count));
        }

        let colon = memchr(b':', line).ok_or(HttpError::InvalidHeader)?;
        if colon == 0 || line[colon - 1] == b' ' || line[colon - 1] == b'\t' {
            // RFC 7230 forbids whitespace between field name and colon.
            return Err(HttpError::InvalidHeader);
        }

        let mut value_start = colon + 1;
        while value_start < line.len() && (line[value_start] == b' ' || line[value_start] == b'\t')
        {
            value_start += 1;
        }
        let mut value_end = line.len();
        while value_end > value_start
            && (line[value_end - 1] == b' ' || line[value_end - 1] == b'\t')
        {
            value_end -= 1;
        }

        let key = ByteRange::new(content.offset, colon);
        let value = ByteRange::new(content.offset + value_start, value_end - value_start);
        let (key_bytes, value_bytes) = (&line[..colon], &line[value_start..value_end]);

        if key_bytes.eq_ignore_ascii_case(b"content-length") {
            let n = ascii_to_usize(value_bytes).ok_or(HttpError::InvalidContentLength)?;
            if n > self.limits.body_size {
                return Err(HttpError::BodyTooLarge(self.limits.body_size));
            }
            self.content_length = n;
        } else if key_bytes.eq_ignore_ascii_case(b"connection") {
            if value_bytes.eq_ignore_ascii_case(b"close") {
                self.connection_close = Some(true);
            } else if value_bytes.eq_ignore_ascii_case(b"keep-alive") {
                self.connection_close = Some(false);
            }
        }

        current.headers.push(HeaderRange { key, value });
        Ok(())
    }

    /// Headers-complete: validate the head, hand the consumed prefix over
    /// to the request, and switch to body collection if one was declared.
    fn finish_headers(&mut self, nl: usize) -> Result<(), HttpError> {
        let head_len = nl + 1;

        if simdutf8::basic::from_utf8(&self.buf[..head_len]).is_err() {
            return Err(HttpError::InvalidEncoding);
        }

        let content_length = self.content_length;
        let close = self.connection_close.unwrap_or(self.close_by_default);
        let current = self.current.as_mut().ok_or(HttpError::InvalidHeader)?;
        current.last = close;
        current.content_length = content_length;

        // Buffer hand-over: the head becomes the request's own storage and
        // the parser keeps only the unconsumed remainder.
        current.buffer = self.buf.drain(..head_len).collect();
        self.scan = 0;
        self.line_start = 0;

        if content_length > 0 {
            current.body = Some(ByteRange::new(current.buffer.len(), content_length));
            self.state = State::Body {
                remaining: content_length,
            };
        } else {
            self.finish_message();
        }
        Ok(())
    }

    fn finish_message(&mut self) {
        if let Some(mut request) = self.current.take() {
            self.parsed += 1;
            if self.parsed >= self.limits.max_pipelined {
                request.last = true;
            }
            self.done.push_back(request);
        }
        self.state = State::RequestLine;
    }
}

#[inline]
fn ascii_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(n)
}

/// Splits a request target into its components, recording a range per
/// component present. `base` is the target's offset inside the message
/// buffer, so recorded ranges resolve against the finished request.
fn parse_url_fields(
    url: &[u8],
    base: usize,
    fields: &mut [Option<ByteRange>; URL_FIELD_COUNT],
) -> Result<(), HttpError> {
    let mut set = |field: UrlField, start: usize, len: usize| {
        if len > 0 {
            fields[field as usize] = Some(ByteRange::new(base + start, len));
        }
    };

    if url == b"*" {
        // Asterisk form (OPTIONS *): no components.
        return Ok(());
    }

    let path_start = if url[0] == b'/' {
        0
    } else {
        // Absolute form: scheme "://" authority [path-query-fragment]
        let colon = memchr(b':', url).ok_or(HttpError::InvalidUrl)?;
        if colon == 0 || !url[colon..].starts_with(b"://") {
            return Err(HttpError::InvalidUrl);
        }
        if !url[..colon]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
        {
            return Err(HttpError::InvalidUrl);
        }
        set(UrlField::Scheme, 0, colon);

        let auth_start = colon + 3;
        let auth_rel_end = url[auth_start..]
            .iter()
            .position(|&b| matches!(b, b'/' | b'?' | b'#'))
            .map(|i| auth_start + i)
            .unwrap_or(url.len());

        let authority = &url[auth_start..auth_rel_end];
        if authority.is_empty() {
            return Err(HttpError::InvalidUrl);
        }

        let host_start = match memrchr(b'@', authority) {
            Some(at) => {
                set(UrlField::Userinfo, auth_start, at);
                auth_start + at + 1
            }
            None => auth_start,
        };
        let hostport = &url[host_start..auth_rel_end];
        if hostport.is_empty() {
            return Err(HttpError::InvalidUrl);
        }

        // Only split a port off after any IPv6 literal bracket.
        let bracket = memrchr(b']', hostport).map(|i| i + 1).unwrap_or(0);
        match memrchr(b':', &hostport[bracket..]) {
            Some(rel) => {
                let colon_at = bracket + rel;
                let port = &hostport[colon_at + 1..];
                if port.is_empty() || !port.iter().all(u8::is_ascii_digit) {
                    return Err(HttpError::InvalidUrl);
                }
                set(UrlField::Host, host_start, colon_at);
                set(UrlField::Port, host_start + colon_at + 1, port.len());
            }
            None => set(UrlField::Host, host_start, hostport.len()),
        }

        auth_rel_end
    };

    if path_start >= url.len() {
        return Ok(());
    }
    let rest = &url[path_start..];

    let query_at = memchr(b'?', rest);
    let hash_at = memchr(b'#', rest);

    let path_end = match (query_at, hash_at) {
        (Some(q), Some(h)) => q.min(h),
        (Some(q), None) => q,
        (None, Some(h)) => h,
        (None, None) => rest.len(),
    };
    set(UrlField::Path, path_start, path_end);

    if let Some(q) = query_at {
        // A '?' after '#' belongs to the fragment, not a query.
        if hash_at.map_or(true, |h| h > q) {
            let q_end = hash_at.unwrap_or(rest.len());
            set(UrlField::Query, path_start + q + 1, q_end - q - 1);
        }
    }
    if let Some(h) = hash_at {
        set(UrlField::Fragment, path_start + h + 1, rest.len() - h - 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(limits: ReqLimits, input: &[u8]) -> Result<Vec<Request>, HttpError> {
        let mut parser = Parser::new(limits);
        parser.append_data(input)?;
        let mut out = Vec::new();
        while let Some(req) = parser.take_request() {
            out.push(req);
        }
        Ok(out)
    }

    fn summarize(req: &Request) -> (Method, Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>, bool)
    {
        (
            req.method(),
            req.url_bytes().to_vec(),
            req.headers()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect(),
            req.body().map(|b| b.to_vec()),
            req.is_last(),
        )
    }

    #[test]
    fn parses_a_simple_get() {
        let reqs = parse_all(
            ReqLimits::default(),
            b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .unwrap();

        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.url_bytes(), b"/hello");
        assert_eq!(req.path(), b"/hello");
        assert_eq!(req.header_value("host"), Some(&b"example.com"[..]));
        assert_eq!(req.body(), None);
        assert!(!req.is_last());
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let wire: &[u8] = b"POST /submit?k=v HTTP/1.1\r\n\
            Host: localhost\r\n\
            Content-Length: 11\r\n\
            \r\n\
            hello world\
            GET /next HTTP/1.1\r\nConnection: close\r\n\r\n";

        let whole = parse_all(ReqLimits::default(), wire).unwrap();

        let mut parser = Parser::new(ReqLimits::default());
        for b in wire {
            parser.append_data(std::slice::from_ref(b)).unwrap();
        }
        let mut one_by_one = Vec::new();
        while let Some(req) = parser.take_request() {
            one_by_one.push(req);
        }

        assert_eq!(whole.len(), 2);
        assert_eq!(whole.len(), one_by_one.len());
        for (a, b) in whole.iter().zip(&one_by_one) {
            assert_eq!(summarize(a), summarize(b));
        }
        assert_eq!(whole[0].body(), Some(&b"hello world"[..]));
        assert!(whole[1].is_last());
    }

    #[test]
    fn pipelined_requests_come_out_in_order() {
        let reqs = parse_all(
            ReqLimits::default(),
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        let urls: Vec<&[u8]> = reqs.iter().map(|r| r.url_bytes()).collect();
        assert_eq!(urls, [b"/a", b"/b", b"/c"]);
    }

    #[test]
    fn head_buffer_is_handed_over() {
        let mut parser = Parser::new(ReqLimits::default());
        parser
            .append_data(b"GET / HTTP/1.1\r\n\r\nGET /pending HTTP/1.1\r")
            .unwrap();

        // Everything up to the first message's end moved into its request;
        // only the second, incomplete message remains buffered.
        assert_eq!(parser.buffered_len(), "GET /pending HTTP/1.1\r".len());
        let req = parser.take_request().unwrap();
        assert_eq!(req.url_bytes(), b"/");
    }

    #[test]
    fn connection_semantics() {
        let last = parse_all(
            ReqLimits::default(),
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
        assert!(last[0].is_last());

        let old = parse_all(ReqLimits::default(), b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(old[0].is_last());

        let kept = parse_all(
            ReqLimits::default(),
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert!(!kept[0].is_last());
    }

    #[test]
    fn pipeline_cap_marks_the_last_request() {
        let limits = ReqLimits {
            max_pipelined: 2,
            ..ReqLimits::default()
        };
        let reqs = parse_all(limits, b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n").unwrap();
        assert!(!reqs[0].is_last());
        assert!(reqs[1].is_last());
    }

    #[test]
    fn header_cap_is_a_hard_failure() {
        let limits = ReqLimits {
            header_count: 2,
            ..ReqLimits::default()
        };
        let ok = parse_all(
            limits.clone(),
            b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n",
        );
        assert!(ok.is_ok());

        let err = parse_all(limits, b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n");
        assert!(matches!(err, Err(HttpError::TooManyHeaders(2))));
    }

    #[test]
    fn malformed_input_is_rejected() {
        for (input, note) in [
            (&b"BREW / HTTP/1.1\r\n\r\n"[..], "unknown method"),
            (b"GET / HTTP/2.0\r\n\r\n", "unsupported version"),
            (b"GET  HTTP/1.1\r\n\r\n", "missing url"),
            (b"GET / HTTP/1.1\nHost: x\r\n\r\n", "bare LF"),
            (b"GET / HTTP/1.1\r\nNo-Colon-Here\r\n\r\n", "no colon"),
            (b"GET / HTTP/1.1\r\nBad : x\r\n\r\n", "space before colon"),
            (
                b"GET / HTTP/1.1\r\nContent-Length: nope\r\n\r\n",
                "bad length",
            ),
        ] {
            assert!(
                parse_all(ReqLimits::default(), input).is_err(),
                "expected failure: {note}"
            );
        }
    }

    #[test]
    fn body_size_limit() {
        let limits = ReqLimits {
            body_size: 4,
            ..ReqLimits::default()
        };
        let err = parse_all(limits, b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert!(matches!(err, Err(HttpError::BodyTooLarge(4))));
    }

    #[test]
    fn origin_form_url_fields() {
        let reqs = parse_all(
            ReqLimits::default(),
            b"GET /app/sub?x=1&y=2#frag HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        let req = &reqs[0];
        assert_eq!(req.url_field(UrlField::Path), Some(&b"/app/sub"[..]));
        assert_eq!(req.url_field(UrlField::Query), Some(&b"x=1&y=2"[..]));
        assert_eq!(req.url_field(UrlField::Fragment), Some(&b"frag"[..]));
        assert_eq!(req.url_field(UrlField::Scheme), None);
        assert_eq!(req.url_field(UrlField::Host), None);
    }

    #[test]
    fn absolute_form_url_fields() {
        let reqs = parse_all(
            ReqLimits::default(),
            b"GET http://user@example.com:8080/path?q=1 HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        let req = &reqs[0];
        assert_eq!(req.url_field(UrlField::Scheme), Some(&b"http"[..]));
        assert_eq!(req.url_field(UrlField::Userinfo), Some(&b"user"[..]));
        assert_eq!(req.url_field(UrlField::Host), Some(&b"example.com"[..]));
        assert_eq!(req.url_field(UrlField::Port), Some(&b"8080"[..]));
        assert_eq!(req.url_field(UrlField::Path), Some(&b"/path"[..]));
        assert_eq!(req.url_field(UrlField::Query), Some(&b"q=1"[..]));
    }

    #[test]
    fn empty_line_between_messages_is_tolerated() {
        let reqs = parse_all(
            ReqLimits::default(),
            b"GET /a HTTP/1.1\r\n\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].url_bytes(), b"/b");
    }
}
