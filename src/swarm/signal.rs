use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, info, warn, Instrument};

use super::{
    analyzer::FitAnalyzer,
    config::Config,
    conn::Dialer,
    debrief::Debriefer,
    manager::SwarmManagerGenerator,
    map::SwarmMap,
    negotiator::RoundtripNegotiator,
    request::{Request, RequestHandler, RequestStreams},
    tracker::LoadTracker,
    transmuter::Transmuter,
    wire::MessageDecoder,
    Result,
};

/// A running signaling core: every component, the periodic tasks that keep
/// loads and distances fresh, and the request streams feeding it.
pub struct Signal {
    tracker: Arc<LoadTracker>,
    analyzer: Arc<FitAnalyzer>,
    map: Arc<SwarmMap>,
    transmuter: Arc<Transmuter>,
    streams: RequestStreams,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Signal {
    /// Builds every component from `config` and starts the background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Config,
        dialer: Arc<dyn Dialer>,
        debriefer: Arc<dyn Debriefer>,
        decoder: MessageDecoder,
    ) -> Self {
        let tracker = Arc::new(LoadTracker::new(config.tracker.clone()));
        let analyzer = Arc::new(FitAnalyzer::with_preferred_loads(
            config.analyzer.clone(),
            tracker.clone(),
        ));
        let negotiator = Arc::new(RoundtripNegotiator::new(
            config.negotiator.clone(),
            decoder,
        ));
        let generator = SwarmManagerGenerator::new(
            config.manager.clone(),
            config.gateway.clone(),
            dialer,
            debriefer,
            negotiator,
            tracker.clone(),
        );
        let map = Arc::new(SwarmMap::new(generator));
        let transmuter = Arc::new(Transmuter::new(
            config.transmuter.clone(),
            map.clone(),
            analyzer.clone(),
        ));
        let streams = RequestStreams::spawn(
            &config.requests,
            RequestHandler::new(map.clone(), transmuter.clone(), tracker.clone()),
        );

        let cancel = CancellationToken::new();
        let tasks = vec![
            {
                let (tracker, cancel) = (tracker.clone(), cancel.clone());
                tokio::spawn(
                    async move { tracker.run(cancel).await }
                        .instrument(debug_span!("tracker")),
                )
            },
            {
                let (analyzer, cancel) = (analyzer.clone(), cancel.clone());
                tokio::spawn(
                    async move { analyzer.run(cancel).await }
                        .instrument(debug_span!("analyzer")),
                )
            },
            {
                let (transmuter, cancel) = (transmuter.clone(), cancel.clone());
                tokio::spawn(
                    async move { transmuter.run(cancel).await }
                        .instrument(debug_span!("transmuter")),
                )
            },
        ];
        info!("signal started");

        Self {
            tracker,
            analyzer,
            map,
            transmuter,
            streams,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn submit(&self, request: Request) -> Result<()> {
        self.streams.submit(request).await
    }

    pub fn map(&self) -> &Arc<SwarmMap> {
        &self.map
    }

    pub fn tracker(&self) -> &Arc<LoadTracker> {
        &self.tracker
    }

    pub fn analyzer(&self) -> &Arc<FitAnalyzer> {
        &self.analyzer
    }

    pub fn transmuter(&self) -> &Arc<Transmuter> {
        &self.transmuter
    }

    /// Stops the periodic tasks, handles every request already queued, then
    /// closes every swarm.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.streams.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        self.map.close_all().await;
        info!("signal stopped");
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
