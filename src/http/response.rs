//! Thread-safe HTTP response assembly and incremental drain.
//!
//! A [`Response`] is an ordered list of output chunks behind a mutex: a
//! container's worker thread appends (status line, headers, body
//! fragments) while the reactor thread drains whatever is outstanding
//! each time the socket can take more bytes. Chunk storage grows as
//! needed; the scatter/gather bound applies per drain call, not to the
//! list itself.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::errors::HttpError;
use crate::http::types::{http_date, status_phrase};
use crate::limits::RespLimits;
use crate::reactor::Notifier;

const SERVER_TOKEN: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));

/// Outcome of one [`Response::send`] drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Nothing outstanding and the handler has not finished: wait for it
    /// to append more (no write readiness needed).
    Pending,
    /// The socket stopped taking bytes mid-drain: retry on the next
    /// writable event.
    Blocked,
    /// Every chunk drained and the handler signalled completion.
    Done,
}

struct Chunks {
    list: VecDeque<Vec<u8>>,
    completed: bool,
}

/// One in-flight HTTP response, paired 1:1 with its request.
pub struct Response {
    chunks: Mutex<Chunks>,
    last: bool,
    wake: Option<(Notifier, std::os::fd::RawFd)>,
}

impl Response {
    /// `last` is propagated from the paired request; `wake`, when present,
    /// tells the reactor which connection gained drainable bytes.
    pub fn new(last: bool, wake: Option<(Notifier, std::os::fd::RawFd)>) -> Self {
        Self {
            chunks: Mutex::new(Chunks {
                list: VecDeque::new(),
                completed: false,
            }),
            last,
            wake,
        }
    }

    /// Copies `data` into a fresh chunk at the tail of the list.
    pub fn append_data(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.push_chunk(data.to_vec());
    }

    /// Emits `HTTP/1.1 <code> <phrase>\r\n`. Codes outside the standard
    /// registry are refused.
    pub fn write_status_line(&self, code: u16) -> Result<(), HttpError> {
        let phrase = status_phrase(code).ok_or(HttpError::UnknownStatusCode(code))?;
        self.push_chunk(format!("HTTP/1.1 {code} {phrase}\r\n").into_bytes());
        Ok(())
    }

    /// Emits one `key: value\r\n` header line.
    pub fn write_header(&self, key: &str, value: &str) {
        let mut line = Vec::with_capacity(key.len() + value.len() + 4);
        line.extend_from_slice(key.as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.push_chunk(line);
    }

    /// Terminates the header block: always emits `Server` and `Date`,
    /// plus `Connection: close` when this response ends its connection.
    pub fn end_headers(&self) {
        let mut tail = Vec::with_capacity(96);
        tail.extend_from_slice(b"Server: ");
        tail.extend_from_slice(SERVER_TOKEN.as_bytes());
        tail.extend_from_slice(b"\r\nDate: ");
        tail.extend_from_slice(http_date(SystemTime::now()).as_bytes());
        tail.extend_from_slice(b"\r\n");
        if self.last {
            tail.extend_from_slice(b"Connection: close\r\n");
        }
        tail.extend_from_slice(b"\r\n");
        self.push_chunk(tail);
    }

    /// Writes a complete minimal HTML error page — status line, headers,
    /// body, completion — in one call.
    pub fn write_error(&self, code: u16) -> Result<(), HttpError> {
        let phrase = status_phrase(code).ok_or(HttpError::UnknownStatusCode(code))?;
        let body = format!(
            "<html><head><title>{code} {phrase}</title></head>\
             <body><h1>{code} {phrase}</h1></body></html>"
        );
        self.write_status_line(code)?;
        self.write_header("Content-Type", "text/html; charset=utf-8");
        self.write_header("Content-Length", &body.len().to_string());
        self.end_headers();
        self.append_data(body.as_bytes());
        self.end_body();
        Ok(())
    }

    /// Marks the response complete: the handler will append nothing more.
    pub fn end_body(&self) {
        {
            let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
            chunks.completed = true;
        }
        self.notify();
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
    }

    /// Whether the connection must close once this response is drained.
    #[inline]
    pub const fn is_last(&self) -> bool {
        self.last
    }

    /// Drains outstanding chunks into `out` with scatter/gather writes,
    /// at most `limits.writev_batch` slices per syscall.
    ///
    /// Fully consumed chunks are dropped; a partially consumed chunk has
    /// its leading bytes discarded so the same chunk resumes on the next
    /// call. `WouldBlock` maps to [`SendState::Blocked`]; other I/O
    /// errors propagate.
    pub fn send<W: Write>(&self, out: &mut W, limits: &RespLimits) -> io::Result<SendState> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if chunks.list.is_empty() {
                return Ok(if chunks.completed {
                    SendState::Done
                } else {
                    SendState::Pending
                });
            }

            let batch: Vec<IoSlice<'_>> = chunks
                .list
                .iter()
                .take(limits.writev_batch)
                .map(|c| IoSlice::new(c))
                .collect();

            let mut written = match out.write_vectored(&batch) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendState::Blocked)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            while written > 0 {
                let front_len = match chunks.list.front() {
                    Some(front) => front.len(),
                    None => break,
                };
                if written >= front_len {
                    chunks.list.pop_front();
                    written -= front_len;
                } else {
                    if let Some(front) = chunks.list.front_mut() {
                        front.drain(..written);
                    }
                    written = 0;
                }
            }
        }
    }

    fn push_chunk(&self, chunk: Vec<u8>) {
        {
            let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
            chunks.list.push_back(chunk);
        }
        self.notify();
    }

    #[inline]
    fn notify(&self) {
        if let Some((notifier, fd)) = &self.wake {
            notifier.notify_writable(*fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `cap` bytes per call, then blocks once.
    struct Throttled {
        out: Vec<u8>,
        cap: usize,
        block_next: bool,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.cap);
            self.out.extend_from_slice(&buf[..n]);
            self.block_next = true;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain_fully(resp: &Response, out: &mut Vec<u8>) -> SendState {
        resp.send(out, &RespLimits::default()).unwrap()
    }

    #[test]
    fn drain_preserves_append_order() {
        let resp = Response::new(false, None);
        resp.write_status_line(200).unwrap();
        resp.write_header("Content-Type", "text/plain");
        resp.end_headers();
        resp.append_data(b"hello ");
        resp.append_data(b"world");
        resp.end_body();

        let mut out = Vec::new();
        assert_eq!(drain_fully(&resp, &mut out), SendState::Done);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"));
        assert!(text.contains("\r\nServer: "));
        assert!(text.contains("\r\nDate: "));
        assert!(!text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn last_response_advertises_close() {
        let resp = Response::new(true, None);
        resp.write_status_line(204).unwrap();
        resp.end_headers();
        resp.end_body();

        let mut out = Vec::new();
        drain_fully(&resp, &mut out);
        assert!(String::from_utf8(out).unwrap().contains("Connection: close\r\n"));
    }

    #[test]
    fn partial_writes_resume_where_they_stopped() {
        let resp = Response::new(false, None);
        resp.append_data(b"abcdefghij");
        resp.append_data(b"0123456789");
        resp.end_body();

        let mut w = Throttled {
            out: Vec::new(),
            cap: 3,
            block_next: false,
        };
        let limits = RespLimits::default();

        let mut states = Vec::new();
        loop {
            match resp.send(&mut w, &limits).unwrap() {
                SendState::Done => break,
                s => states.push(s),
            }
        }
        assert!(states.iter().all(|s| *s == SendState::Blocked));
        assert_eq!(w.out, b"abcdefghij0123456789");
    }

    #[test]
    fn pending_until_completion_signalled() {
        let resp = Response::new(false, None);
        let mut out = Vec::new();

        assert_eq!(drain_fully(&resp, &mut out), SendState::Pending);

        resp.append_data(b"x");
        assert_eq!(drain_fully(&resp, &mut out), SendState::Pending);
        assert_eq!(out, b"x");

        resp.end_body();
        assert_eq!(drain_fully(&resp, &mut out), SendState::Done);
        assert!(resp.is_complete());
    }

    #[test]
    fn unknown_status_code_is_refused() {
        let resp = Response::new(false, None);
        assert!(matches!(
            resp.write_status_line(299),
            Err(HttpError::UnknownStatusCode(299))
        ));
    }

    #[test]
    fn error_page_is_complete_in_one_call() {
        let resp = Response::new(false, None);
        resp.write_error(404).unwrap();
        assert!(resp.is_complete());

        let mut out = Vec::new();
        assert_eq!(drain_fully(&resp, &mut out), SendState::Done);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/html"));
        assert!(text.contains("<h1>404 Not Found</h1>"));
        let body_at = text.find("\r\n\r\n").unwrap() + 4;
        let declared: usize = text
            .lines()
            .find(|l| l.starts_with("Content-Length: "))
            .and_then(|l| l["Content-Length: ".len()..].parse().ok())
            .unwrap();
        assert_eq!(text.len() - body_at, declared);
    }

    #[test]
    fn appends_while_draining_are_picked_up() {
        use std::sync::Arc;
        use std::thread;

        let resp = Arc::new(Response::new(false, None));
        let writer = resp.clone();
        let appender = thread::spawn(move || {
            for i in 0..50u8 {
                writer.append_data(&[i]);
            }
            writer.end_body();
        });

        let mut out = Vec::new();
        let limits = RespLimits::default();
        loop {
            match resp.send(&mut out, &limits).unwrap() {
                SendState::Done => break,
                _ => std::thread::yield_now(),
            }
        }
        appender.join().unwrap();

        let expected: Vec<u8> = (0..50u8).collect();
        assert_eq!(out, expected);
    }
}
