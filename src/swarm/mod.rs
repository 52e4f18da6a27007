// Every dataspace is served by exactly one swarm, and every swarm owns one
// gateway: a pool of endpoint addresses that are dialed lazily and lent out
// to bootstrap new peers. Requests never touch a gateway directly. They go
// through the swarm map, which is the only place that decides which swarm a
// dataspace belongs to, and through the transmuter, which moves endpoints
// between swarms as demand shifts.

// Three tasks run for the lifetime of the signal: the load tracker folds raw
// request counters into averaged load, the fit analyzer recomputes how far
// each dataspace is from the size its load justifies, and the transmuter acts
// on the analyzer's candidates. None of them hold a directory or tracker lock
// while they talk to the network. Negotiations run with the gateway unlocked;
// only refilling the active queue dials under the gateway lock. Derived sizes
// are allowed to lag behind the truth for a few changes rather than stall
// concurrent pair attempts.

// Structural changes (bisect and stitch) are the exception. They hold the
// gateway lock of the swarm being reshaped for the whole redistribution, so
// pair attempts against that swarm wait, while every other swarm keeps
// serving.

pub mod analyzer;
pub mod config;
pub mod conn;
pub mod debrief;
mod error;
pub mod gateway;
pub mod manager;
pub mod map;
pub mod negotiator;
pub mod request;
pub mod signal;
pub mod tracker;
pub mod transmuter;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{Error, Result};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a swarm. Swarm IDs are handed out by the swarm map from a
/// monotonic counter and are never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SwarmId(pub u64);

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swarm-{}", self.0)
    }
}

/// A value read from a peer right after it is lent out, expressing the load
/// it would like to carry. `None` means the peer didn't say.
pub type Debrief = Option<i32>;
