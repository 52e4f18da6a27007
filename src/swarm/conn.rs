use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tracing::trace;

/// A live connection to one peer. This is everything the swarm core needs
/// from a transport: bytes in, bytes out, a stable address to dial the peer
/// back on, and a way to tell whether the peer is still there.
#[async_trait]
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    /// The address this peer can be dialed on.
    fn address(&self) -> &str;

    /// Returns true once the connection is known to be dead, either because
    /// it was closed locally or because the peer hung up. Never blocks.
    fn is_closed(&mut self) -> bool;

    /// Shuts the connection down. Closing an already closed connection is an
    /// error.
    async fn close(&mut self) -> io::Result<()>;
}

/// Opens connections to pooled endpoint addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> io::Result<Box<dyn Connection>>;
}

pub struct TcpConnection {
    stream: TcpStream,
    address: String,
    closed: bool,
}

impl TcpConnection {
    /// Wraps an accepted stream, addressing it by the remote socket address.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let address = stream.peer_addr()?.to_string();
        Ok(Self::with_address(stream, address))
    }

    /// Wraps a stream whose peer is reachable on a different address than
    /// the one it connected from, e.g. a listening port it advertised.
    pub fn with_address(stream: TcpStream, address: String) -> Self {
        Self {
            stream,
            address,
            closed: false,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_closed(&mut self) -> bool {
        if self.closed {
            return true;
        }
        // a single non-blocking peek: EOF or an error means the peer is gone,
        // pending or buffered data means it's alive
        let mut one = [0u8; 1];
        let peeked = self.stream.peek(&mut one).now_or_never();
        if let Some(Ok(0)) | Some(Err(_)) = peeked {
            trace!(address = %self.address, "peer hung up");
            self.closed = true;
        }
        self.closed
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        self.closed = true;
        self.stream.shutdown().await
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Dials endpoints over plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::with_address(
            stream,
            address.to_string(),
        )))
    }
}
