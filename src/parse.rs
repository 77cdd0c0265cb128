//! HTTP/1.1 header-section handling for the upgrade and CONNECT handshakes.
//!
//! Only the header section is ever parsed; everything after it belongs to
//! the relay protocol and stays queued in the [`HandshakeReader`].

#[cfg(test)]
use http::Method;
use http::{HeaderValue, StatusCode};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

/// How much data to read for a handshake header section before it's
/// considered invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Read size for one [`HandshakeReader::fill`] call.
const FILL_CHUNK: usize = 2048;

/// Reader for the handshake phase of a connection.
///
/// Header parsing cannot know where the header section ends before parsing
/// it, so reads overshoot: the bytes queued behind the header section (for
/// instance the first relay frame right behind a `101 Switching Protocols`)
/// must survive the handshake. `HandshakeReader` queues everything read but
/// not yet consumed, and afterwards serves as a plain `AsyncRead` that
/// yields the queued remainder before touching the wire again.
#[derive(Debug)]
pub struct HandshakeReader<R> {
    inner: R,
    /// Read-but-unparsed bytes; `..pos` is the consumed prefix.
    buf: Vec<u8>,
    pos: usize,
    /// Cap on queued (unconsumed) bytes.
    limit: usize,
}

impl<R: AsyncRead + Unpin> HandshakeReader<R> {
    /// Wraps `inner`, refusing to queue more than `limit` bytes.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            limit,
        }
    }

    /// The queued bytes that have not been consumed yet.
    pub fn peeked(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Marks the first `n` queued bytes as consumed.
    pub(crate) fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Whether the queue is at its cap.
    pub(crate) fn at_limit(&self) -> bool {
        self.buf.len() - self.pos >= self.limit
    }

    /// Reads one more chunk from the wire into the queue. Returns the byte
    /// count; zero means end of stream (or a full queue).
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        let mut chunk = [0u8; FILL_CHUNK];
        let n = self.inner.read(&mut chunk[..room.min(FILL_CHUNK)]).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Splits into the queued remainder and the wire reader.
    pub fn into_parts(self) -> (bytes::Bytes, R) {
        (bytes::Bytes::copy_from_slice(&self.buf[self.pos..]), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HandshakeReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let pending = &this.buf[this.pos..];
            let n = pending.len().min(out.remaining());
            out.put_slice(&pending[..n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

/// Parsed HTTP response status line and headers.
#[derive(Debug)]
pub(crate) struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    #[allow(dead_code)]
    pub headers: http::HeaderMap<HeaderValue>,
}

impl HttpResponse {
    /// Formats the status line the way it appeared on the wire.
    pub(crate) fn status_line(&self) -> String {
        format!(
            "{} {}",
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or("")
        )
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub(crate) fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = header_map(res.headers);
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section,
    /// consuming it from `reader`. Bytes past the header section stay
    /// queued.
    pub(crate) async fn read(
        reader: &mut HandshakeReader<impl AsyncRead + Unpin>,
    ) -> Result<Self> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.peeked())? {
                reader.consume(len);
                return Ok(response);
            }
            if reader.at_limit() {
                return Err(limit_reached("response"));
            }
            if reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of response header section",
                )
                .into());
            }
        }
    }
}

/// Parsed HTTP request line and headers.
///
/// The client never reads requests; this is the server side of the upgrade
/// handshake, for the in-crate relay server the tests run against.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: http::HeaderMap<HeaderValue>,
}

#[cfg(test)]
impl HttpRequest {
    /// Parses a request from a buffer and returns `None` when incomplete.
    pub(crate) fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req
                    .method
                    .context("missing HTTP method")?
                    .parse()
                    .std_context("invalid HTTP method")?;
                let path = req.path.context("missing request target")?.to_string();
                let headers = header_map(req.headers);
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        path,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the request line and header section, consuming it
    /// from `reader`.
    pub(crate) async fn read(
        reader: &mut HandshakeReader<impl AsyncRead + Unpin>,
    ) -> Result<Self> {
        loop {
            if let Some((len, request)) = Self::parse_with_len(reader.peeked())? {
                reader.consume(len);
                return Ok(request);
            }
            if reader.at_limit() {
                return Err(limit_reached("request"));
            }
            if reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of request header section",
                )
                .into());
            }
        }
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn header_map(headers: &mut [httparse::Header<'_>]) -> http::HeaderMap<HeaderValue> {
    http::HeaderMap::from_iter(headers.iter().flat_map(|h| {
        let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        Some((name, value))
    }))
}

fn limit_reached(what: &str) -> n0_error::AnyError {
    io::Error::new(
        io::ErrorKind::OutOfMemory,
        format!("buffer size limit reached before end of {what} header section"),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn queued_bytes_come_before_the_wire() {
        let mut reader = HandshakeReader::new(Cursor::new(&b"head tail"[..]), 5);
        reader.fill().await.unwrap();
        assert_eq!(reader.peeked(), b"head ");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head tail");
    }

    #[tokio::test]
    async fn consume_frees_room_for_more() {
        let mut reader = HandshakeReader::new(Cursor::new(&b"abcdef"[..]), 4);
        reader.fill().await.unwrap();
        assert_eq!(reader.peeked(), b"abcd");
        assert!(reader.at_limit());

        reader.consume(3);
        assert_eq!(reader.peeked(), b"d");
        reader.fill().await.unwrap();
        assert_eq!(reader.peeked(), b"def");
        assert!(!reader.at_limit());
    }

    #[tokio::test]
    async fn into_parts_carries_the_remainder() {
        let mut reader = HandshakeReader::new(Cursor::new(&b"header-rest"[..]), 64);
        reader.fill().await.unwrap();
        reader.consume(7);
        let (rest, mut inner) = reader.into_parts();
        assert_eq!(&rest[..], b"rest");
        let mut out = Vec::new();
        inner.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"");
    }

    #[tokio::test]
    async fn fill_stops_at_eof_and_at_limit() {
        let mut reader = HandshakeReader::new(Cursor::new(&b""[..]), 16);
        assert_eq!(reader.fill().await.unwrap(), 0);

        let mut reader = HandshakeReader::new(Cursor::new(&b"xxxx-more"[..]), 4);
        reader.fill().await.unwrap();
        assert!(reader.at_limit());
        assert_eq!(reader.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reads_switching_protocols() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: DERP\r\n\r\n\x01rest";
        let mut reader = HandshakeReader::new(Cursor::new(&raw[..]), HEADER_SECTION_MAX_LENGTH);
        let res = HttpResponse::read(&mut reader).await.unwrap();
        assert_eq!(res.status, StatusCode::SWITCHING_PROTOCOLS);
        // The first relay byte stays queued for the codec.
        assert_eq!(reader.peeked(), b"\x01rest");
    }

    #[test]
    fn response_parse_partial() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(HttpResponse::parse_with_len(raw).unwrap().is_none());
    }

    #[test]
    fn response_keeps_reason() {
        let raw = b"HTTP/1.1 407 Proxy Auth Needed\r\n\r\n";
        let (_, res) = HttpResponse::parse_with_len(raw).unwrap().unwrap();
        assert_eq!(res.status_line(), "407 Proxy Auth Needed");
    }

    #[tokio::test]
    async fn reads_upgrade_request() {
        let raw = b"GET /derp HTTP/1.1\r\nHost: relay.test\r\nUpgrade: DERP\r\nConnection: Upgrade\r\n\r\n";
        let mut reader = HandshakeReader::new(Cursor::new(&raw[..]), HEADER_SECTION_MAX_LENGTH);
        let req = HttpRequest::read(&mut reader).await.unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path, "/derp");
        assert_eq!(req.header("upgrade"), Some("DERP"));
        assert!(req.header("host").is_some());
        assert!(reader.peeked().is_empty());
    }

    #[tokio::test]
    async fn truncated_request_is_eof() {
        let raw = b"GET /derp HTTP/1.1\r\nHost: rel";
        let mut reader = HandshakeReader::new(Cursor::new(&raw[..]), HEADER_SECTION_MAX_LENGTH);
        let err = HttpRequest::read(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("header section"));
    }
}
