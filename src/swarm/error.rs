use std::io;

use super::SwarmId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("already closed")]
    Closed,

    #[error("no active endpoints")]
    NoActiveEndpoints,

    #[error("inactive queue is empty")]
    InactiveQueueEmpty,

    #[error("no undersized dataspace to place a new endpoint in")]
    NoNeedyDataspace,

    #[error("roundtrip limit of {0} reached without the acceptor agreeing")]
    RoundtripLimitReached(usize),

    #[error("failed to dial endpoint {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("no swarm serves dataspace {0}")]
    UnknownDataspace(String),

    #[error("no swarm with id {0}")]
    UnknownSwarm(SwarmId),

    #[error("dataspace {0} is already registered")]
    DataspaceAlreadyRegistered(String),

    #[error("cannot {0} a swarm with itself")]
    SelfReference(&'static str),

    #[error("split of {0} would leave one side without dataspaces")]
    EmptyPlacement(SwarmId),

    #[error("message length {0} exceeds the configured maximum")]
    MessageLengthOverflowed(u64),

    #[error("could not decode message: {0}")]
    CouldNotDecodeMessage(String),

    #[error("could not encode message: {0}")]
    CouldNotEncodeMessage(String),

    #[error("invalid connection code {0}")]
    InvalidConnectionCode(u8),

    #[error("active queue is full")]
    ActiveQueueFull,

    #[error("cannot resize active queue to {capacity}, it holds {size} entries")]
    ResizeBelowSize { capacity: usize, size: usize },

    #[error("active queue capacity must be at least one")]
    ZeroCapacity,

    #[error("request queue is closed")]
    QueueClosed,

    #[error("invalid configuration: {0}")]
    Config(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Transient errors are expected under normal operation. Callers log them
    /// and skip the operation instead of failing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Closed
                | Error::NoActiveEndpoints
                | Error::InactiveQueueEmpty
                | Error::NoNeedyDataspace
                | Error::RoundtripLimitReached(_)
        )
    }

    /// True when the error only means the pool had nothing to lend.
    pub fn is_pool_empty(&self) -> bool {
        matches!(self, Error::NoActiveEndpoints | Error::InactiveQueueEmpty)
    }
}
