//! Test doubles for the transport. Connections are in-memory duplex pipes,
//! and the dialer hands out one end while keeping (or scripting) the other.

use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::{
    io::{duplex, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    sync::Semaphore,
};

use super::conn::{Connection, Dialer};

const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) struct MockConnection {
    stream: DuplexStream,
    address: String,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    /// Returns the connection and the far end of its pipe.
    pub(crate) fn pair(address: &str) -> (Self, DuplexStream) {
        let (near, far) = duplex(PIPE_CAPACITY);
        (
            Self {
                stream: near,
                address: address.to_string(),
                closed: Arc::new(AtomicBool::new(false)),
            },
            far,
        )
    }

    /// A connection whose peer is already gone.
    pub(crate) fn dead(address: &str) -> Self {
        let (conn, _) = Self::pair(address);
        conn.closed.store(true, Ordering::SeqCst);
        conn
    }

    /// Flag shared with the connection, for tests that inspect or flip
    /// liveness after the connection has been handed away.
    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_closed(&mut self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "already closed"));
        }
        self.stream.shutdown().await
    }
}

impl AsyncRead for MockConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockConnection {
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

/// Runs the far end of a dialed connection.
pub(crate) type PeerScript =
    Arc<dyn Fn(String, DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct MockDialer {
    preference: Option<i32>,
    script: Option<PeerScript>,
    gate: Option<Arc<Semaphore>>,
    unreachable: Mutex<HashSet<String>>,
    dead: Mutex<HashSet<String>>,
    dials: AtomicUsize,
    // far ends kept open so dialed connections don't see EOF
    peers: Mutex<Vec<DuplexStream>>,
}

impl MockDialer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every dialed peer reports this preferred load before anything else.
    pub(crate) fn with_preference(mut self, preference: i32) -> Self {
        self.preference = Some(preference);
        self
    }

    pub(crate) fn with_script(mut self, script: PeerScript) -> Self {
        self.script = Some(script);
        self
    }

    /// Every dial waits for a permit from `gate` before connecting.
    pub(crate) fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn set_unreachable(&self, address: &str) {
        self.unreachable.lock().insert(address.to_string());
    }

    /// Dials to `address` succeed, but the peer is gone by the time the
    /// connection is used.
    pub(crate) fn set_dead(&self, address: &str) {
        self.dead.lock().insert(address.to_string());
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, address: &str) -> io::Result<Box<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::Interrupted, "gate closed"))?
                .forget();
        }
        if self.unreachable.lock().contains(address) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
        }
        if self.dead.lock().contains(address) {
            return Ok(Box::new(MockConnection::dead(address)));
        }
        let (conn, mut far) = MockConnection::pair(address);
        if let Some(preference) = self.preference {
            far.write_all(&preference.to_be_bytes()).await?;
        }
        match &self.script {
            Some(script) => {
                tokio::spawn(script(address.to_string(), far));
            }
            None => self.peers.lock().push(far),
        }
        Ok(Box::new(conn))
    }
}
