//! Host↔guest vsock byte streams.
//!
//! The Virtualization framework hands out a raw socket file descriptor per
//! guest connection. [`VsockConn`] wraps that fd in a
//! [`tokio::net::UnixStream`] (the fd is an `AF_VSOCK` socket, not a Unix
//! socket per se, but it behaves identically for read/write) and layers the
//! addressing and half-close semantics the engine transport needs on top.
//!
//! ## Half-close
//!
//! The underlying transport cannot carry a wire-level half-close, so
//! [`VsockConn::close_write`] (and `poll_shutdown`) only set a local flag:
//! the write side refuses further writes while the read side keeps
//! operating until the peer closes or [`VsockConn::close`] is called. Peers
//! must detect end-of-input by application-level framing, not by a
//! TCP-style FIN. This matters for the engine's exec streaming protocol,
//! where stdin EOF is signalled by half-closing: a `CloseWrite` that also
//! tore down the read side would hang every command that reads then writes.

use std::fmt;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Well-known guest vsock port of the in-VM container engine.
pub const ENGINE_PORT: u32 = 2375;

/// A vsock endpoint address `(context id, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockAddr {
    pub cid: u32,
    pub port: u32,
}

impl VsockAddr {
    /// The hypervisor host context id.
    pub const HOST_CID: u32 = 2;
    /// The first guest context id; VZ assigns it to the single guest.
    pub const GUEST_CID: u32 = 3;

    /// Network tag carried by these connections.
    pub fn network(&self) -> &'static str {
        "vsock"
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsock:{}:{}", self.cid, self.port)
    }
}

/// One host↔guest byte stream.
pub struct VsockConn {
    stream: UnixStream,
    local: VsockAddr,
    peer: VsockAddr,
    write_closed: bool,
    closed: bool,
}

impl VsockConn {
    /// Wrap a connection fd obtained from the virtualization framework.
    ///
    /// The caller must own `fd` exclusively (dup it out of the framework
    /// object first); it is closed when the connection drops.
    pub fn from_raw_fd(fd: RawFd, port: u32) -> io::Result<Self> {
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        Ok(Self::from_unix_stream(stream, port))
    }

    /// Wrap an already-connected stream (used by tests and fakes).
    pub fn from_unix_stream(stream: UnixStream, port: u32) -> Self {
        Self {
            stream,
            local: VsockAddr {
                cid: VsockAddr::HOST_CID,
                port: 0,
            },
            peer: VsockAddr {
                cid: VsockAddr::GUEST_CID,
                port,
            },
            write_closed: false,
            closed: false,
        }
    }

    pub fn local_addr(&self) -> VsockAddr {
        self.local
    }

    pub fn peer_addr(&self) -> VsockAddr {
        self.peer
    }

    /// Logical half-close: no further writes, reads keep operating.
    pub fn close_write(&mut self) {
        self.write_closed = true;
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Close both directions. Idempotent; subsequent reads return EOF and
    /// writes fail.
    pub fn close(&mut self) {
        self.closed = true;
        self.write_closed = true;
    }
}

impl AsyncRead for VsockConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for VsockConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write half is closed",
            )));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    // Shutdown is the logical half-close: no wire-level shutdown exists on
    // this transport, so the read side stays open.
    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

/// Opens fresh guest connections on numbered ports. One implementation per
/// machine backend; fakes use socketpairs.
#[async_trait::async_trait]
pub trait VsockConnect: Send + Sync {
    async fn connect(&self, port: u32) -> Result<VsockConn>;
}

/// A dialer bound to one guest port.
///
/// Holds only a weak reference to the VM's connector: once the VM is shut
/// down, dialing fails with a transport error instead of keeping the
/// machine alive.
#[derive(Clone)]
pub struct VsockDialer {
    connector: Weak<dyn VsockConnect>,
    port: u32,
}

impl VsockDialer {
    pub fn new(connector: &Arc<dyn VsockConnect>, port: u32) -> Self {
        Self {
            connector: Arc::downgrade(connector),
            port,
        }
    }

    pub fn from_weak(connector: Weak<dyn VsockConnect>, port: u32) -> Self {
        Self { connector, port }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Open a fresh connection to the bound port.
    pub async fn dial(&self) -> Result<VsockConn> {
        let connector = self
            .connector
            .upgrade()
            .ok_or_else(|| Error::Transport("VM is shut down".to_string()))?;
        connector.connect(self.port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(port: u32) -> (VsockConn, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (VsockConn::from_unix_stream(a, port), b)
    }

    #[test]
    fn addr_display_and_network() {
        let addr = VsockAddr { cid: 3, port: 2375 };
        assert_eq!(addr.to_string(), "vsock:3:2375");
        assert_eq!(addr.network(), "vsock");
    }

    #[tokio::test]
    async fn round_trip() {
        let (mut conn, mut peer) = pair(2375);
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn half_close_keeps_read_side_open() {
        let (mut conn, mut peer) = pair(2375);

        conn.close_write();
        assert!(conn.is_write_closed());
        assert!(conn.write_all(b"nope").await.is_err());

        // The peer can still deliver data after our half-close.
        peer.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        // Peer close now yields EOF.
        drop(peer);
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_the_logical_half_close() {
        let (mut conn, mut peer) = pair(2375);

        // AsyncWriteExt::shutdown must not tear down the read side.
        conn.shutdown().await.unwrap();
        peer.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reads_eof() {
        let (mut conn, mut peer) = pair(2375);
        peer.write_all(b"unread").await.unwrap();

        conn.close();
        conn.close();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(conn.write_all(b"x").await.is_err());
    }

    struct PairConnector;

    #[async_trait::async_trait]
    impl VsockConnect for PairConnector {
        async fn connect(&self, port: u32) -> Result<VsockConn> {
            let (a, b) = UnixStream::pair().map_err(Error::Io)?;
            // Echo everything back.
            tokio::spawn(async move {
                let (mut r, mut w) = b.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(VsockConn::from_unix_stream(a, port))
        }
    }

    #[tokio::test]
    async fn dialer_fails_after_connector_dropped() {
        let connector: Arc<dyn VsockConnect> = Arc::new(PairConnector);
        let dialer = VsockDialer::new(&connector, ENGINE_PORT);
        assert_eq!(dialer.port(), ENGINE_PORT);

        let mut conn = dialer.dial().await.unwrap();
        conn.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(connector);
        assert!(matches!(dialer.dial().await, Err(Error::Transport(_))));
    }
}
