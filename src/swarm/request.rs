//! Inbound requests and the queues that feed them to the core.
//!
//! Each request kind belongs to one stream. Streams are bounded queues
//! drained by a single task, so requests on one stream are handled one at a
//! time and in order, while the streams run independently of each other.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    config::RequestConfig,
    conn::Connection,
    map::SwarmMap,
    tracker::SwarmInfo,
    transmuter::{ConnectionCode, Transmuter},
    Error::*,
    Result,
};

pub enum Request {
    /// A peer wants to be introduced to a member of the dataspace's swarm.
    Localize {
        dataspace: String,
        conn: Box<dyn Connection>,
    },
    /// An endpoint offers to serve.
    Connect {
        dataspace: String,
        conn: Box<dyn Connection>,
    },
    /// An endpoint leaves the dataspace's swarm.
    Disconnect {
        dataspace: String,
        conn: Box<dyn Connection>,
    },
    Register { dataspace: String },
    Deregister { dataspace: String },
}

impl Request {
    pub fn dataspace(&self) -> &str {
        match self {
            Request::Localize { dataspace, .. }
            | Request::Connect { dataspace, .. }
            | Request::Disconnect { dataspace, .. }
            | Request::Register { dataspace }
            | Request::Deregister { dataspace } => dataspace,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Localize { .. } => "localize",
            Request::Connect { .. } => "connect",
            Request::Disconnect { .. } => "disconnect",
            Request::Register { .. } => "register",
            Request::Deregister { .. } => "deregister",
        }
    }

    fn stream(&self) -> Stream {
        match self {
            Request::Localize { .. } => Stream::Pairing,
            Request::Connect { .. } | Request::Disconnect { .. } => Stream::Membership,
            Request::Register { .. } | Request::Deregister { .. } => Stream::Registration,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Request");
        debug
            .field("kind", &self.kind())
            .field("dataspace", &self.dataspace());
        match self {
            Request::Localize { conn, .. }
            | Request::Connect { conn, .. }
            | Request::Disconnect { conn, .. } => debug.field("address", &conn.address()),
            _ => &mut debug,
        };
        debug.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Pairing,
    Membership,
    Registration,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Pairing => "pairing",
            Stream::Membership => "membership",
            Stream::Registration => "registration",
        }
    }
}

/// Everything a request needs to be carried out.
#[derive(Clone)]
pub struct RequestHandler {
    map: Arc<SwarmMap>,
    transmuter: Arc<Transmuter>,
    info: Arc<dyn SwarmInfo>,
}

impl RequestHandler {
    pub fn new(
        map: Arc<SwarmMap>,
        transmuter: Arc<Transmuter>,
        info: Arc<dyn SwarmInfo>,
    ) -> Self {
        Self {
            map,
            transmuter,
            info,
        }
    }

    /// Carries out one request. Any connection it carries is closed
    /// afterwards, whether or not the request succeeded.
    pub async fn handle(&self, request: Request) -> Result<()> {
        match request {
            Request::Localize {
                dataspace,
                mut conn,
            } => {
                let paired = self.localize(&dataspace, conn.as_mut()).await;
                finish(conn).await;
                paired
            }
            Request::Connect {
                dataspace,
                mut conn,
            } => {
                let joined = self
                    .transmuter
                    .process_connection(
                        &dataspace,
                        ConnectionCode::Connect,
                        conn.as_mut(),
                    )
                    .await;
                finish(conn).await;
                joined
            }
            Request::Disconnect {
                dataspace,
                mut conn,
            } => {
                let left = self
                    .transmuter
                    .process_connection(
                        &dataspace,
                        ConnectionCode::Disconnect,
                        conn.as_mut(),
                    )
                    .await;
                finish(conn).await;
                left
            }
            Request::Register { dataspace } => {
                self.map.add_swarm(&dataspace).await.map(|_| ())
            }
            Request::Deregister { dataspace } => self.map.remove_swarm(&dataspace).await,
        }
    }

    async fn localize(&self, dataspace: &str, conn: &mut dyn Connection) -> Result<()> {
        let swarm = self.map.get_swarm(dataspace).await?;
        self.info.increment_frequency_counter(dataspace);
        swarm.attempt_to_pair(dataspace, conn).await
    }
}

async fn finish(mut conn: Box<dyn Connection>) {
    if conn.is_closed() {
        return;
    }
    if let Err(e) = conn.close().await {
        trace!(
            address = %conn.address(),
            error = %e,
            "request connection was already closed"
        );
    }
}

struct Senders {
    pairing: mpsc::Sender<Request>,
    membership: mpsc::Sender<Request>,
    registration: mpsc::Sender<Request>,
}

impl Senders {
    fn get(&self, stream: Stream) -> mpsc::Sender<Request> {
        match stream {
            Stream::Pairing => self.pairing.clone(),
            Stream::Membership => self.membership.clone(),
            Stream::Registration => self.registration.clone(),
        }
    }
}

/// The three request queues and the tasks draining them.
pub struct RequestStreams {
    senders: Mutex<Option<Senders>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestStreams {
    /// Opens the queues and spawns one task per queue.
    pub fn spawn(config: &RequestConfig, handler: RequestHandler) -> Self {
        let capacity = config.queue_capacity.max(1);
        let mut tasks = Vec::with_capacity(3);
        let mut open = |stream: Stream| {
            let (tx, rx) = mpsc::channel(capacity);
            let span = debug_span!("requests", stream = stream.name());
            tasks.push(tokio::spawn(drain(rx, handler.clone()).instrument(span)));
            tx
        };
        let senders = Senders {
            pairing: open(Stream::Pairing),
            membership: open(Stream::Membership),
            registration: open(Stream::Registration),
        };
        Self {
            senders: Mutex::new(Some(senders)),
            tasks: Mutex::new(tasks),
        }
    }

    /// Queues a request on its stream. Waits while that stream is full.
    pub async fn submit(&self, request: Request) -> Result<()> {
        let sender = match self.senders.lock().as_ref() {
            Some(senders) => senders.get(request.stream()),
            None => Err(QueueClosed)?,
        };
        sender.send(request).await.map_err(|_| QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.senders.lock().is_none()
    }

    /// Stops accepting requests and waits until every queued request has
    /// been handled.
    pub async fn close(&self) {
        drop(self.senders.lock().take());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "request stream task failed");
            }
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<Request>, handler: RequestHandler) {
    debug!("request stream open");
    while let Some(request) = rx.recv().await {
        let kind = request.kind();
        let dataspace = request.dataspace().to_string();
        match handler.handle(request).await {
            Ok(()) => debug!(kind, dataspace, "handled request"),
            Err(e) if e.is_transient() => {
                debug!(kind, dataspace, error = %e, "skipped request")
            }
            Err(e) => warn!(kind, dataspace, error = %e, "request failed"),
        }
    }
    debug!("request stream closed");
}
