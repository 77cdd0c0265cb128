//! Transport plumbing: boxed dialed streams, the plain/TLS duplex stream,
//! and the force-close guard that backs `Close` and reconnect teardown.

use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A connected byte stream as produced by a [`Dialer`](crate::Dialer):
/// a plain TCP socket or a proxy-tunneled (possibly TLS-wrapped) transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug + 'static> AsyncStream for T {}

/// Boxed transport returned by dialing.
pub type TcpTransport = Box<dyn AsyncStream>;

fn force_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection force-closed")
}

/// Handle that force-closes a [`GuardedIo`] from outside its owner.
///
/// Closing fails all pending and future I/O on the transport, which unparks
/// a receiver blocked in the codec and lets the connection be dropped.
#[derive(Debug, Clone)]
pub(crate) struct IoCloser(CancellationToken);

impl IoCloser {
    pub(crate) fn close(&self) {
        self.0.cancel();
    }

    fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// The dialed transport, wrapped so it can be force-closed while the relay
/// codec owns it. Sits beneath the TLS layer.
pub struct GuardedIo {
    inner: TcpTransport,
    closer: IoCloser,
    // One stored waiter per direction: the read and write halves are polled
    // from different tasks and each needs its own waker slot.
    read_halt: Pin<Box<WaitForCancellationFutureOwned>>,
    write_halt: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl GuardedIo {
    pub(crate) fn new(inner: TcpTransport) -> (Self, IoCloser) {
        let token = CancellationToken::new();
        let closer = IoCloser(token.clone());
        let io = Self {
            inner,
            closer: closer.clone(),
            read_halt: Box::pin(token.clone().cancelled_owned()),
            write_halt: Box::pin(token.cancelled_owned()),
        };
        (io, closer)
    }

    fn read_halted(&mut self, cx: &mut Context<'_>) -> bool {
        self.closer.is_closed() || self.read_halt.as_mut().poll(cx).is_ready()
    }

    fn write_halted(&mut self, cx: &mut Context<'_>) -> bool {
        self.closer.is_closed() || self.write_halt.as_mut().poll(cx).is_ready()
    }
}

impl fmt::Debug for GuardedIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedIo")
            .field("closed", &self.closer.is_closed())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for GuardedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_halted(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for GuardedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_halted(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_halted(cx) {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_halted(cx) {
            // Already aborted; nothing graceful left to do.
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// What we speak HTTP (and then the relay protocol) over: the guarded
/// transport directly in cleartext mode, or TLS on top of it.
pub enum MaybeTlsStream {
    /// Cleartext transport.
    Plain(GuardedIo),
    /// TLS client stream over the guarded transport.
    Tls(tokio_rustls::client::TlsStream<GuardedIo>),
}

impl fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            Self::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
