use std::sync::Arc;

use tokio::{
    select,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    analyzer::{Candidate, FitAnalyzer},
    config::TransmuterConfig,
    conn::Connection,
    map::SwarmMap,
    Error::*,
    Result,
};

/// What an endpoint asks for when it contacts the signal about its own
/// membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionCode {
    Connect = 0,
    Disconnect = 1,
}

impl TryFrom<u8> for ConnectionCode {
    type Error = super::Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Disconnect),
            other => Err(InvalidConnectionCode(other)),
        }
    }
}

/// Places joining endpoints where they are needed most and moves endpoints
/// between swarms as the analyzer's distances shift.
pub struct Transmuter {
    config: TransmuterConfig,
    map: Arc<SwarmMap>,
    analyzer: Arc<FitAnalyzer>,
}

impl Transmuter {
    pub fn new(
        config: TransmuterConfig,
        map: Arc<SwarmMap>,
        analyzer: Arc<FitAnalyzer>,
    ) -> Self {
        Self {
            config,
            map,
            analyzer,
        }
    }

    /// Handles an endpoint joining or leaving.
    ///
    /// A joiner is admitted to the most starved dataspace's swarm no matter
    /// which dataspace it named. If nothing is starved the joiner is turned
    /// away without an acknowledgement.
    pub async fn process_connection(
        &self,
        dataspace: &str,
        code: ConnectionCode,
        conn: &mut dyn Connection,
    ) -> Result<()> {
        match code {
            ConnectionCode::Connect => {
                let needy = match self.analyzer.most_needy() {
                    Ok(needy) => needy,
                    Err(e) if e.is_transient() => {
                        debug!(
                            requested = dataspace,
                            address = %conn.address(),
                            "no dataspace needs another endpoint"
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let swarm = self.map.get_swarm(&needy).await?;
                swarm.add_endpoint(conn).await?;
                for served in swarm.dataspaces() {
                    self.analyzer.credit(&served, 1);
                }
                trace!(
                    requested = dataspace,
                    placed = %needy,
                    swarm = %swarm.id(),
                    "placed joining endpoint"
                );
            }
            ConnectionCode::Disconnect => {
                let swarm = self.map.get_swarm(dataspace).await?;
                swarm.remove_endpoint(conn).await?;
                for served in swarm.dataspaces() {
                    self.analyzer.credit(&served, -1);
                }
            }
        }
        Ok(())
    }

    /// Applies every candidate the analyzer currently proposes. A candidate
    /// that fails or has nothing to do is skipped. Returns how many were
    /// applied.
    pub async fn transmute(&self) -> usize {
        let mut applied = 0;
        for candidate in self.analyzer.calculate_candidates() {
            match self.apply(&candidate).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!(?candidate, error = %e, "skipping transfer"),
            }
        }
        if self.config.structural_rebalancing {
            let layout = self.map.layout().await;
            for candidate in self.analyzer.calculate_structural_candidates(&layout) {
                match self.apply(&candidate).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(?candidate, error = %e, "skipping structural change")
                    }
                }
            }
        }
        if applied > 0 {
            info!(applied, "rebalanced swarms");
        }
        applied
    }

    /// Returns false when the candidate turned out to need no change.
    async fn apply(&self, candidate: &Candidate) -> Result<bool> {
        match candidate {
            Candidate::Transfer {
                transferer,
                transferee,
                size,
            } => {
                let from = self.map.get_swarm(transferer).await?;
                let to = self.map.get_swarm(transferee).await?;
                if from.id() == to.id() {
                    trace!(swarm = %from.id(), "transfer within one swarm");
                    return Ok(false);
                }
                let mut moved = 0;
                for address in from.get_endpoints(*size).await {
                    // the transferee owns the endpoint before the transferer
                    // lets go, so it is never in neither swarm
                    if to.take_endpoint(&address).await? {
                        from.drop_endpoint(&address).await?;
                        moved += 1;
                    }
                }
                debug!(from = %from.id(), to = %to.id(), moved, "transferred endpoints");
                Ok(true)
            }
            Candidate::Split {
                swarm,
                placement_one,
                placement_two,
            } => {
                self.map.split(*swarm, placement_one, placement_two).await?;
                Ok(true)
            }
            Candidate::Merge { swarms } => {
                self.map.merge(*swarms).await?;
                Ok(true)
            }
        }
    }

    /// Transmutes every `poll_period` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.poll_period();
        let mut interval = time::interval_at(Instant::now() + period, period);
        debug!(?period, "transmuter started");
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.transmute().await;
                }
            }
        }
        debug!("transmuter stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::swarm::{
        config::AnalyzerConfig,
        manager::tests::generator,
        mock::{MockConnection, MockDialer},
        tracker::{LoadTracker, SwarmInfo},
        wire::OPERATION_SUCCESS,
    };

    struct Fixture {
        map: Arc<SwarmMap>,
        tracker: Arc<LoadTracker>,
        analyzer: Arc<FitAnalyzer>,
        transmuter: Transmuter,
    }

    async fn fixture(dataspaces: &[&str], structural: bool) -> Fixture {
        let (generator, tracker) = generator(1_000, Arc::new(MockDialer::new()));
        let map = Arc::new(SwarmMap::new(generator));
        for ds in dataspaces {
            map.add_swarm(ds).await.unwrap();
        }
        let analyzer = Arc::new(FitAnalyzer::with_preferred_loads(
            AnalyzerConfig::default(),
            tracker.clone(),
        ));
        let transmuter = Transmuter::new(
            TransmuterConfig::builder()
                .structural_rebalancing(structural)
                .build(),
            map.clone(),
            analyzer.clone(),
        );
        Fixture {
            map,
            tracker,
            analyzer,
            transmuter,
        }
    }

    fn demand(tracker: &LoadTracker, dataspace: &str, requests: usize) {
        for _ in 0..requests {
            tracker.increment_frequency_counter(dataspace);
        }
    }

    #[test]
    fn connection_codes() {
        assert_eq!(ConnectionCode::try_from(0).unwrap(), ConnectionCode::Connect);
        assert_eq!(ConnectionCode::try_from(1).unwrap(), ConnectionCode::Disconnect);
        assert!(matches!(
            ConnectionCode::try_from(7),
            Err(InvalidConnectionCode(7))
        ));
    }

    #[tokio::test]
    async fn joiners_go_where_they_are_needed() {
        let f = fixture(&["a", "b"], false).await;
        demand(&f.tracker, "b", 30);
        f.tracker.fold_counters();
        f.analyzer.refresh_distances();

        let (mut joiner, mut far) = MockConnection::pair("peer-0");
        f.transmuter
            .process_connection("a", ConnectionCode::Connect, &mut joiner)
            .await
            .unwrap();
        assert_eq!(far.read_u8().await.unwrap(), OPERATION_SUCCESS);

        let b = f.map.get_swarm("b").await.unwrap();
        assert_eq!(b.get_endpoints(10).await, vec!["peer-0"]);
        assert_eq!(f.map.get_swarm("a").await.unwrap().total_endpoints().await, 0);
        // [1 x 49, 30] averages to 1, so one member was all b needed
        let b_distance = f
            .analyzer
            .distances()
            .into_iter()
            .find(|d| d.dataspace == "b")
            .unwrap();
        assert_eq!(b_distance.distance, 0);
        assert!(f.analyzer.most_needy().is_err());
    }

    #[tokio::test]
    async fn joiners_are_turned_away_when_nobody_is_starved() {
        let f = fixture(&["a"], false).await;
        f.analyzer.refresh_distances();

        let (mut joiner, mut far) = MockConnection::pair("peer-0");
        f.transmuter
            .process_connection("a", ConnectionCode::Connect, &mut joiner)
            .await
            .unwrap();
        drop(joiner);
        let mut rest = Vec::new();
        far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(f.map.get_swarm("a").await.unwrap().total_endpoints().await, 0);
    }

    #[tokio::test]
    async fn leavers_are_removed_from_the_dataspace_they_name() {
        let f = fixture(&["a"], false).await;
        let a = f.map.get_swarm("a").await.unwrap();
        a.take_endpoint("peer-0").await.unwrap();

        let (mut leaver, mut far) = MockConnection::pair("peer-0");
        f.transmuter
            .process_connection("a", ConnectionCode::Disconnect, &mut leaver)
            .await
            .unwrap();
        assert_eq!(far.read_u8().await.unwrap(), OPERATION_SUCCESS);
        assert_eq!(a.total_endpoints().await, 0);

        let (mut stranger, _far) = MockConnection::pair("peer-1");
        assert!(matches!(
            f.transmuter
                .process_connection("zzz", ConnectionCode::Disconnect, &mut stranger)
                .await,
            Err(UnknownDataspace(_))
        ));
    }

    #[tokio::test]
    async fn transfers_move_endpoints_from_oversized_to_starved() {
        let sustain_demand = |f: &Fixture| {
            // a full window, so the seeded ones are gone
            for _ in 0..50 {
                demand(&f.tracker, "a", 1);
                demand(&f.tracker, "b", 4);
                f.tracker.fold_counters();
            }
        };
        let f = fixture(&["a", "b"], false).await;
        let a = f.map.get_swarm("a").await.unwrap();
        for i in 0..6 {
            a.take_endpoint(&format!("peer-{i}")).await.unwrap();
        }
        a.publish_size().await;
        sustain_demand(&f);
        assert_eq!(f.tracker.get_load("a"), Some(1));
        assert_eq!(f.tracker.get_load("b"), Some(4));

        // a: 6 - 1 = +5, b: 0 - 4 = -4
        f.analyzer.refresh_distances();
        assert_eq!(f.transmuter.transmute().await, 1);

        let b = f.map.get_swarm("b").await.unwrap();
        assert_eq!(a.total_endpoints().await, 2);
        assert_eq!(b.total_endpoints().await, 4);
        assert!(f.analyzer.most_needy().is_err());
    }

    #[tokio::test]
    async fn transfers_within_one_swarm_are_not_counted() {
        let f = fixture(&["a"], false).await;
        let id = f.map.get_swarm_id("a").await.unwrap();
        f.map.add_dataspace(id, "b").await.unwrap();
        let swarm = f.map.get_swarm_manager(id).await.unwrap();
        for i in 0..6 {
            swarm.take_endpoint(&format!("peer-{i}")).await.unwrap();
        }
        swarm.publish_size().await;
        for _ in 0..50 {
            demand(&f.tracker, "a", 1);
            demand(&f.tracker, "b", 10);
            f.tracker.fold_counters();
        }

        // a: 6 - 1 = +5, b: 6 - 10 = -4, but both are served by one swarm
        f.analyzer.refresh_distances();
        assert_eq!(
            f.analyzer.calculate_candidates(),
            vec![Candidate::Transfer {
                transferer: "a".into(),
                transferee: "b".into(),
                size: 4,
            }]
        );
        f.analyzer.refresh_distances();
        assert_eq!(f.transmuter.transmute().await, 0);
        assert_eq!(swarm.total_endpoints().await, 6);
        assert_eq!(f.map.swarm_count().await, 1);
    }

    #[tokio::test]
    async fn structural_rebalancing_splits_crowded_swarms() {
        let f = fixture(&["a"], true).await;
        let id = f.map.get_swarm_id("a").await.unwrap();
        f.map.add_dataspace(id, "b").await.unwrap();
        let swarm = f.map.get_swarm_manager(id).await.unwrap();
        for i in 0..60 {
            swarm.take_endpoint(&format!("peer-{i}")).await.unwrap();
        }

        assert_eq!(f.transmuter.transmute().await, 1);
        assert_eq!(f.map.swarm_count().await, 2);
        let a = f.map.get_swarm("a").await.unwrap();
        let b = f.map.get_swarm("b").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.total_endpoints().await + b.total_endpoints().await, 60);
    }

    #[tokio::test]
    async fn structural_rebalancing_is_opt_in() {
        let f = fixture(&["a"], false).await;
        let id = f.map.get_swarm_id("a").await.unwrap();
        f.map.add_dataspace(id, "b").await.unwrap();
        let swarm = f.map.get_swarm_manager(id).await.unwrap();
        for i in 0..60 {
            swarm.take_endpoint(&format!("peer-{i}")).await.unwrap();
        }

        assert_eq!(f.transmuter.transmute().await, 0);
        assert_eq!(f.map.swarm_count().await, 1);
    }
}
