//! A swarm's pool of endpoints.
//!
//! The gateway owns addresses, not peers. Cold addresses wait in the
//! [`InactiveQueue`], ranked by how often they have been lent out. When a
//! caller asks for an endpoint and no live connection is ready, the least
//! used addresses are dialed into the bounded [`ActiveQueue`]. Lending an
//! endpoint hands the live connection to the caller and puts its address
//! straight back into the inactive queue with its score bumped, so lending
//! never changes membership.

mod active;
mod inactive;

pub use active::ActiveQueue;
pub use inactive::InactiveQueue;

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::{
    config::GatewayConfig,
    conn::{Connection, Dialer},
    debrief::Debriefer,
    Debrief,
    Error::*,
    Result,
};

struct ActiveEndpoint {
    conn: Box<dyn Connection>,
    hit_score: u64,
}

struct GatewayState {
    active: ActiveQueue<ActiveEndpoint>,
    inactive: InactiveQueue,
    closed: bool,
}

impl GatewayState {
    fn new(active_capacity: usize) -> Self {
        Self {
            active: ActiveQueue::new(active_capacity),
            inactive: InactiveQueue::new(),
            closed: false,
        }
    }

    fn holds(&self, address: &str) -> bool {
        self.inactive.contains(address)
            || self.active.iter().any(|ep| ep.conn.address() == address)
    }

    fn total(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Closed)?
        }
        Ok(())
    }
}

pub struct EndpointGateway {
    state: Mutex<GatewayState>,
    dialer: Arc<dyn Dialer>,
    debriefer: Arc<dyn Debriefer>,
}

impl EndpointGateway {
    pub fn new(
        config: &GatewayConfig,
        dialer: Arc<dyn Dialer>,
        debriefer: Arc<dyn Debriefer>,
    ) -> Self {
        Self::with_capacity(config.active_capacity(), dialer, debriefer)
    }

    fn with_capacity(
        active_capacity: usize,
        dialer: Arc<dyn Dialer>,
        debriefer: Arc<dyn Debriefer>,
    ) -> Self {
        Self {
            state: Mutex::new(GatewayState::new(active_capacity)),
            dialer,
            debriefer,
        }
    }

    /// Admits a cold address. Returns false if the address is already
    /// pooled.
    pub async fn push_endpoint(&self, address: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if state.holds(address) {
            trace!(address, "endpoint already pooled");
            return Ok(false);
        }
        Ok(state.inactive.push_new(address.to_string()))
    }

    /// Evicts an address from whichever queue holds it, closing its live
    /// connection if it had one. Returns false if the address wasn't pooled.
    pub async fn remove_endpoint(&self, address: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if state.inactive.remove(address).is_some() {
            return Ok(true);
        }
        match state
            .active
            .remove_where(|ep| ep.conn.address() == address)
        {
            Some(mut ep) => {
                if let Err(e) = ep.conn.close().await {
                    trace!(address, error = %e, "evicted endpoint was already closed");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lends out the next live endpoint along with what it reported when
    /// debriefed. The caller owns the connection; the address stays pooled.
    ///
    /// Dead connections met on the way are dropped from the pool. If nothing
    /// is ready the active queue is refilled first, which dials.
    pub async fn get_endpoint(&self) -> Result<(Box<dyn Connection>, Debrief)> {
        let mut conn = {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            loop {
                if state.active.is_empty() {
                    self.populate(&mut state).await?;
                }
                let Some(mut ep) = state.active.pop() else {
                    return Err(NoActiveEndpoints);
                };
                if ep.conn.is_closed() {
                    debug!(address = %ep.conn.address(), "discarding dead endpoint");
                    continue;
                }
                state
                    .inactive
                    .push(ep.conn.address().to_string(), ep.hit_score + 1);
                break ep.conn;
            }
        };
        let debrief = self.debriefer.debrief(conn.as_mut()).await;
        trace!(address = %conn.address(), ?debrief, "lent endpoint");
        Ok((conn, debrief))
    }

    /// Dials the least used inactive addresses until the active queue is full
    /// or nothing is left to dial. An address that can't be dialed is dropped
    /// from the pool and ends the refill.
    async fn populate(&self, state: &mut MutexGuard<'_, GatewayState>) -> Result<()> {
        if state.inactive.is_empty() {
            Err(InactiveQueueEmpty)?
        }
        while !state.active.is_full() {
            let Some((address, hit_score)) = state.inactive.pop() else {
                break;
            };
            match self.dialer.dial(&address).await {
                Ok(conn) => state.active.push(ActiveEndpoint { conn, hit_score })?,
                Err(source) => {
                    warn!(
                        address,
                        error = %source,
                        "failed to dial endpoint, dropping it"
                    );
                    Err(Dial { address, source })?
                }
            }
        }
        Ok(())
    }

    /// Up to `limit` pooled addresses, live ones first.
    pub async fn endpoint_addrs(&self, limit: usize) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .active
            .iter()
            .map(|ep| ep.conn.address())
            .chain(state.inactive.addresses())
            .take(limit)
            .map(str::to_string)
            .collect()
    }

    pub async fn total_endpoints(&self) -> usize {
        self.state.lock().await.total()
    }

    /// Changes how many live connections are kept ready. Zero is rejected,
    /// since nothing could be lent out again.
    pub async fn resize_active(&self, capacity: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.active.resize(capacity)
    }

    /// Moves every other endpoint into a new gateway. Live connections
    /// alternate in queue order and cold addresses alternate in score order,
    /// so both halves get a similar mix of hot and cold endpoints.
    pub async fn split(&self) -> Result<EndpointGateway> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let other = Self::with_capacity(
            state.active.capacity(),
            self.dialer.clone(),
            self.debriefer.clone(),
        );
        {
            let mut other_state = other.state.lock().await;
            for (i, ep) in state.active.drain().into_iter().enumerate() {
                let half: &mut GatewayState =
                    if i % 2 == 0 { &mut state } else { &mut other_state };
                half.active.push(ep)?;
            }
            let mut cold = state.inactive.drain();
            cold.sort_by_key(|(_, hit_score)| *hit_score);
            for (i, (address, hit_score)) in cold.into_iter().enumerate() {
                let half: &mut GatewayState =
                    if i % 2 == 0 { &mut state } else { &mut other_state };
                half.inactive.push(address, hit_score);
            }
            debug!(
                kept = state.total(),
                moved = other_state.total(),
                "split gateway"
            );
        }
        Ok(other)
    }

    /// Takes over every endpoint of `other` and closes it. Addresses already
    /// pooled here keep their place and the duplicate is discarded.
    pub async fn absorb(&self, other: &EndpointGateway) -> Result<()> {
        if std::ptr::eq(self, other) {
            Err(SelfReference("merge"))?
        }
        // lock in address order so two opposing merges can't deadlock
        let mine_first = (self as *const Self) < (other as *const Self);
        let (mut state, mut other_state) = if mine_first {
            let mine = self.state.lock().await;
            let theirs = other.state.lock().await;
            (mine, theirs)
        } else {
            let theirs = other.state.lock().await;
            let mine = self.state.lock().await;
            (mine, theirs)
        };
        state.ensure_open()?;
        other_state.ensure_open()?;

        for mut ep in other_state.active.drain() {
            if state.holds(ep.conn.address()) {
                if let Err(e) = ep.conn.close().await {
                    trace!(
                        address = %ep.conn.address(),
                        error = %e,
                        "duplicate endpoint was already closed"
                    );
                }
                continue;
            }
            if state.active.is_full() {
                state.active.grow();
            }
            state.active.push(ep)?;
        }
        for (address, hit_score) in other_state.inactive.drain() {
            if !state.active.iter().any(|ep| ep.conn.address() == address) {
                state.inactive.push(address, hit_score);
            }
        }
        other_state.closed = true;
        debug!(total = state.total(), "absorbed gateway");
        Ok(())
    }

    /// Closes every live connection and forgets every address. Closing twice
    /// is an error and changes nothing.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.closed = true;
        for mut ep in state.active.drain() {
            if let Err(e) = ep.conn.close().await {
                trace!(
                    address = %ep.conn.address(),
                    error = %e,
                    "endpoint was already closed"
                );
            }
        }
        state.inactive.drain();
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::{
        debrief::{LoadPreferenceDebriefer, SilentDebriefer},
        mock::MockDialer,
    };

    fn gateway(capacity: usize, dialer: Arc<MockDialer>) -> EndpointGateway {
        EndpointGateway::new(
            &GatewayConfig::builder().active_capacity(capacity).build(),
            dialer,
            Arc::new(LoadPreferenceDebriefer),
        )
    }

    async fn filled(
        capacity: usize,
        dialer: Arc<MockDialer>,
        n: usize,
    ) -> EndpointGateway {
        let gw = gateway(capacity, dialer);
        for i in 0..n {
            assert!(gw.push_endpoint(&format!("peer-{i}")).await.unwrap());
        }
        gw
    }

    #[tokio::test]
    async fn lending_is_borrow_and_return() {
        let dialer = Arc::new(MockDialer::new().with_preference(7));
        let gw = filled(2, dialer.clone(), 3).await;

        for _ in 0..10 {
            let (conn, debrief) = gw.get_endpoint().await.unwrap();
            assert_eq!(debrief, Some(7));
            assert!(conn.address().starts_with("peer-"));
            assert_eq!(gw.total_endpoints().await, 3);
        }
        assert!(dialer.dials() >= 10);
    }

    #[tokio::test]
    async fn lending_spreads_across_the_pool() {
        let dialer = Arc::new(MockDialer::new().with_preference(1));
        let gw = filled(1, dialer, 3).await;

        let mut lent = Vec::new();
        for _ in 0..3 {
            let (conn, _) = gw.get_endpoint().await.unwrap();
            lent.push(conn.address().to_string());
        }
        lent.sort();
        assert_eq!(lent, vec!["peer-0", "peer-1", "peer-2"]);
    }

    #[tokio::test]
    async fn duplicate_push_is_a_no_op() {
        let gw = filled(4, Arc::new(MockDialer::new()), 2).await;
        assert!(!gw.push_endpoint("peer-1").await.unwrap());
        assert_eq!(gw.total_endpoints().await, 2);
    }

    #[tokio::test]
    async fn empty_pool_is_transient() {
        let gw = gateway(4, Arc::new(MockDialer::new()));
        let err = gw.get_endpoint().await.err().unwrap();
        assert!(matches!(err, InactiveQueueEmpty));
        assert!(err.is_transient());
        assert!(err.is_pool_empty());
    }

    #[tokio::test]
    async fn failed_dial_aborts_refill_and_drops_the_address() {
        let dialer = Arc::new(MockDialer::new());
        dialer.set_unreachable("peer-0");
        let gw = EndpointGateway::new(
            &GatewayConfig::default(),
            dialer,
            Arc::new(SilentDebriefer),
        );
        gw.push_endpoint("peer-0").await.unwrap();
        gw.push_endpoint("peer-1").await.unwrap();

        let err = gw.get_endpoint().await.err().unwrap();
        assert!(matches!(err, Dial { ref address, .. } if address == "peer-0"));
        assert_eq!(gw.total_endpoints().await, 1);

        let (conn, debrief) = gw.get_endpoint().await.unwrap();
        assert_eq!(conn.address(), "peer-1");
        assert_eq!(debrief, None);
    }

    #[tokio::test]
    async fn dead_endpoints_are_skipped() {
        let dialer = Arc::new(MockDialer::new().with_preference(3));
        dialer.set_dead("peer-0");
        let gw = filled(2, dialer, 2).await;

        let (conn, _) = gw.get_endpoint().await.unwrap();
        assert_eq!(conn.address(), "peer-1");
        assert_eq!(gw.total_endpoints().await, 1);
    }

    #[tokio::test]
    async fn removes_from_either_queue() {
        let dialer = Arc::new(MockDialer::new().with_preference(3));
        let gw = filled(2, dialer, 3).await;
        // warms two endpoints, lends one
        let (lent, _) = gw.get_endpoint().await.unwrap();

        let addrs = gw.endpoint_addrs(usize::MAX).await;
        assert_eq!(addrs.len(), 3);
        let live = addrs[0].clone();
        assert_ne!(live, lent.address());

        assert!(gw.remove_endpoint(&live).await.unwrap());
        assert!(gw.remove_endpoint(lent.address()).await.unwrap());
        assert!(!gw.remove_endpoint(lent.address()).await.unwrap());
        assert_eq!(gw.total_endpoints().await, 1);
    }

    #[tokio::test]
    async fn resize_below_size_fails() {
        let dialer = Arc::new(MockDialer::new().with_preference(3));
        let gw = filled(3, dialer, 4).await;
        gw.get_endpoint().await.unwrap();

        assert!(matches!(
            gw.resize_active(1).await,
            Err(ResizeBelowSize { capacity: 1, size: 2 })
        ));
        gw.resize_active(10).await.unwrap();
        assert_eq!(gw.total_endpoints().await, 4);
    }

    #[tokio::test]
    async fn zero_capacity_is_refused_and_lending_goes_on() {
        let dialer = Arc::new(MockDialer::new().with_preference(3));
        let gw = filled(2, dialer, 2).await;
        for _ in 0..2 {
            let (conn, _) = gw.get_endpoint().await.unwrap();
            drop(conn);
        }

        assert!(matches!(gw.resize_active(0).await, Err(ZeroCapacity)));
        let (conn, debrief) = gw.get_endpoint().await.unwrap();
        assert!(conn.address().starts_with("peer-"));
        assert_eq!(debrief, Some(3));
    }

    #[tokio::test]
    async fn split_then_absorb_conserves_membership() {
        let dialer = Arc::new(MockDialer::new().with_preference(2));
        let gw = filled(4, dialer, 9).await;
        gw.get_endpoint().await.unwrap();

        let other = gw.split().await.unwrap();
        let (kept, moved) = (gw.total_endpoints().await, other.total_endpoints().await);
        assert_eq!(kept + moved, 9);
        assert!(kept.abs_diff(moved) <= 2);

        let mut all = gw.endpoint_addrs(usize::MAX).await;
        all.extend(other.endpoint_addrs(usize::MAX).await);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 9);

        gw.absorb(&other).await.unwrap();
        assert_eq!(gw.total_endpoints().await, 9);
        assert!(other.is_closed().await);
        assert!(matches!(other.push_endpoint("x").await, Err(Closed)));
    }

    #[tokio::test]
    async fn absorbing_overlapping_pools_drops_duplicates() {
        let dialer = Arc::new(MockDialer::new().with_preference(1));
        let gw = filled(4, dialer.clone(), 2).await;
        let other = filled(4, dialer, 3).await;
        // lending dials every address into the active queues
        gw.get_endpoint().await.unwrap();
        other.get_endpoint().await.unwrap();

        gw.absorb(&other).await.unwrap();
        let mut all = gw.endpoint_addrs(usize::MAX).await;
        all.sort();
        assert_eq!(all, vec!["peer-0", "peer-1", "peer-2"]);
        assert!(other.is_closed().await);
    }

    #[tokio::test]
    async fn absorbing_itself_is_refused() {
        let gw = filled(4, Arc::new(MockDialer::new()), 1).await;
        assert!(matches!(gw.absorb(&gw).await, Err(SelfReference(_))));
    }

    #[tokio::test]
    async fn close_is_not_idempotent() {
        let dialer = Arc::new(MockDialer::new().with_preference(1));
        let gw = filled(2, dialer, 3).await;
        gw.get_endpoint().await.unwrap();

        gw.close().await.unwrap();
        assert_eq!(gw.total_endpoints().await, 0);
        assert!(matches!(gw.close().await, Err(Closed)));
        assert!(matches!(gw.get_endpoint().await, Err(Closed)));
        assert!(matches!(gw.push_endpoint("peer-9").await, Err(Closed)));
        assert_eq!(gw.total_endpoints().await, 0);
    }
}
