use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::{
    config::{GatewayConfig, ManagerConfig},
    conn::{Connection, Dialer},
    debrief::Debriefer,
    gateway::EndpointGateway,
    negotiator::Negotiator,
    tracker::SwarmInfo,
    wire::OPERATION_SUCCESS,
    Debrief,
    Error::*,
    Result,
    SwarmId,
};

struct ManagerState {
    closed: bool,
    changes: usize,
    dataspaces: Vec<String>,
}

/// Runs one swarm: pairs requesters with pooled endpoints, admits and evicts
/// endpoints, and reshapes its pool when the swarm is split or merged.
pub struct SwarmManager {
    id: SwarmId,
    gateway: EndpointGateway,
    negotiator: Arc<dyn Negotiator>,
    info: Arc<dyn SwarmInfo>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
}

impl SwarmManager {
    pub fn new(
        id: SwarmId,
        gateway: EndpointGateway,
        negotiator: Arc<dyn Negotiator>,
        info: Arc<dyn SwarmInfo>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            id,
            gateway,
            negotiator,
            info,
            config,
            state: Mutex::new(ManagerState {
                closed: false,
                changes: 0,
                dataspaces: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> SwarmId {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            Err(Closed)?
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn dataspaces(&self) -> Vec<String> {
        self.state.lock().dataspaces.clone()
    }

    fn record_debrief(&self, dataspaces: &[String], debrief: Debrief) {
        if let Some(preference) = debrief {
            for dataspace in dataspaces {
                self.info.add_debrief_datapoint(dataspace, preference);
            }
        }
    }

    /// Borrows an endpoint from the pool and negotiates a session between it
    /// and `acceptor`. An empty pool only means nobody can be paired right
    /// now, so it isn't an error.
    pub async fn attempt_to_pair(
        &self,
        dataspace: &str,
        acceptor: &mut dyn Connection,
    ) -> Result<()> {
        self.ensure_open()?;
        let (mut offerer, debrief) = match self.gateway.get_endpoint().await {
            Ok(lent) => lent,
            Err(e) if e.is_pool_empty() => {
                debug!(swarm = %self.id, dataspace, "no endpoint available to pair with");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.record_debrief(&[dataspace.to_string()], debrief);
        let negotiated = self.negotiator.negotiate(offerer.as_mut(), acceptor).await;
        release(offerer.as_mut()).await;
        negotiated?;
        trace!(
            swarm = %self.id,
            offerer = %offerer.address(),
            acceptor = %acceptor.address(),
            "paired"
        );
        Ok(())
    }

    /// Admits a new endpoint. If the swarm already has members, one of them
    /// first hands the newcomer the swarm's context through a negotiation.
    pub async fn add_endpoint(&self, conn: &mut dyn Connection) -> Result<()> {
        self.ensure_open()?;
        match self.gateway.get_endpoint().await {
            Ok((mut existing, debrief)) => {
                self.record_debrief(&self.dataspaces(), debrief);
                let negotiated = self.negotiator.negotiate(existing.as_mut(), conn).await;
                release(existing.as_mut()).await;
                negotiated?;
            }
            Err(e) if e.is_pool_empty() => {
                trace!(swarm = %self.id, "first endpoint, no context to hand over");
            }
            Err(e) => return Err(e),
        }
        self.gateway.push_endpoint(conn.address()).await?;
        self.increment_changes().await;
        acknowledge(conn).await?;
        debug!(swarm = %self.id, address = %conn.address(), "added endpoint");
        Ok(())
    }

    /// Evicts the endpoint behind `conn` and acknowledges it.
    pub async fn remove_endpoint(&self, conn: &mut dyn Connection) -> Result<()> {
        self.ensure_open()?;
        if self.gateway.remove_endpoint(conn.address()).await? {
            self.increment_changes().await;
        }
        acknowledge(conn).await?;
        debug!(swarm = %self.id, address = %conn.address(), "removed endpoint");
        Ok(())
    }

    /// Evicts an address without talking to it.
    pub async fn drop_endpoint(&self, address: &str) -> Result<bool> {
        self.ensure_open()?;
        let dropped = self.gateway.remove_endpoint(address).await?;
        if dropped {
            self.increment_changes().await;
        }
        Ok(dropped)
    }

    /// Admits an address handed over from another swarm.
    pub async fn take_endpoint(&self, address: &str) -> Result<bool> {
        self.ensure_open()?;
        let taken = self.gateway.push_endpoint(address).await?;
        if taken {
            self.increment_changes().await;
        }
        Ok(taken)
    }

    /// Up to `limit` member addresses.
    pub async fn get_endpoints(&self, limit: usize) -> Vec<String> {
        self.gateway.endpoint_addrs(limit).await
    }

    pub async fn total_endpoints(&self) -> usize {
        self.gateway.total_endpoints().await
    }

    /// Sets the dataspaces this swarm serves without publishing anything.
    pub fn assign(&self, dataspaces: Vec<String>) {
        self.state.lock().dataspaces = dataspaces;
    }

    /// Sets the dataspaces this swarm serves and publishes its size for them.
    pub async fn serve(&self, dataspaces: Vec<String>) {
        self.assign(dataspaces);
        self.publish_size().await;
    }

    /// Writes the exact member count to the tracker for every served
    /// dataspace.
    pub async fn publish_size(&self) {
        let size = self.gateway.total_endpoints().await;
        {
            // written under the lock so a dataspace assigned away in the
            // meantime is not published again
            let mut state = self.state.lock();
            state.changes = 0;
            for dataspace in &state.dataspaces {
                self.info.set_size(dataspace, size);
            }
        }
        trace!(swarm = %self.id, size, "published swarm size");
    }

    async fn increment_changes(&self) {
        let publish = {
            let mut state = self.state.lock();
            state.changes += 1;
            state.changes > self.config.change_trigger_limit
        };
        if publish {
            self.publish_size().await;
        }
    }

    /// Moves half of this swarm's endpoints into a new swarm. The new swarm
    /// serves nothing until it is given dataspaces.
    pub async fn bisect(&self, new_id: SwarmId) -> Result<SwarmManager> {
        self.ensure_open()?;
        let gateway = self.gateway.split().await?;
        debug!(swarm = %self.id, new_swarm = %new_id, "bisected swarm");
        Ok(SwarmManager::new(
            new_id,
            gateway,
            self.negotiator.clone(),
            self.info.clone(),
            self.config.clone(),
        ))
    }

    /// Takes over every endpoint of `other` and retires it. The retired
    /// swarm's dataspaces are not touched; the caller reassigns them.
    pub async fn stitch(&self, other: &SwarmManager) -> Result<()> {
        if std::ptr::eq(self, other) {
            Err(SelfReference("stitch"))?
        }
        self.ensure_open()?;
        other.ensure_open()?;
        self.gateway.absorb(&other.gateway).await?;
        other.state.lock().closed = true;
        self.publish_size().await;
        debug!(swarm = %self.id, absorbed = %other.id, "stitched swarms");
        Ok(())
    }

    /// Closes the swarm and its pool. Everything fails afterwards, including
    /// a second close.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                Err(Closed)?
            }
            state.closed = true;
        }
        self.gateway.close().await?;
        debug!(swarm = %self.id, "closed swarm");
        Ok(())
    }
}

/// Closes a lent endpoint once its negotiation is over.
async fn release(conn: &mut dyn Connection) {
    if let Err(e) = conn.close().await {
        trace!(address = %conn.address(), error = %e, "lent endpoint was already closed");
    }
}

async fn acknowledge(conn: &mut dyn Connection) -> Result<()> {
    conn.write_all(&[OPERATION_SUCCESS]).await?;
    conn.flush().await?;
    Ok(())
}

/// Builds swarm managers that share one transport, negotiator and tracker.
pub struct SwarmManagerGenerator {
    manager: ManagerConfig,
    gateway: GatewayConfig,
    dialer: Arc<dyn Dialer>,
    debriefer: Arc<dyn Debriefer>,
    negotiator: Arc<dyn Negotiator>,
    info: Arc<dyn SwarmInfo>,
}

impl SwarmManagerGenerator {
    pub fn new(
        manager: ManagerConfig,
        gateway: GatewayConfig,
        dialer: Arc<dyn Dialer>,
        debriefer: Arc<dyn Debriefer>,
        negotiator: Arc<dyn Negotiator>,
        info: Arc<dyn SwarmInfo>,
    ) -> Self {
        Self {
            manager,
            gateway,
            dialer,
            debriefer,
            negotiator,
            info,
        }
    }

    pub fn generate(&self, id: SwarmId) -> SwarmManager {
        SwarmManager::new(
            id,
            EndpointGateway::new(
                &self.gateway,
                self.dialer.clone(),
                self.debriefer.clone(),
            ),
            self.negotiator.clone(),
            self.info.clone(),
            self.manager.clone(),
        )
    }

    pub fn info(&self) -> &Arc<dyn SwarmInfo> {
        &self.info
    }
}
