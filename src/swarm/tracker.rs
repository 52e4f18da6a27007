use std::collections::VecDeque;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::config::TrackerConfig;

/// What the managers and the analyzer know about dataspaces. Sizes are
/// pushed in by swarm managers; loads and preferences are derived from
/// traffic.
pub trait SwarmInfo: Send + Sync {
    fn get_size(&self, dataspace: &str) -> Option<usize>;
    fn set_size(&self, dataspace: &str, size: usize);
    /// Averaged request frequency. `None` for dataspaces with no history,
    /// including ones evicted for going quiet.
    fn get_load(&self, dataspace: &str) -> Option<u64>;
    /// Every dataspace with a recorded size.
    fn get_dataspaces(&self) -> Vec<String>;
    fn increment_frequency_counter(&self, dataspace: &str);
    fn add_debrief_datapoint(&self, dataspace: &str, preference: i32);
    /// Average load members of this dataspace said they'd like to carry.
    fn preferred_load(&self, dataspace: &str) -> Option<u64>;
    fn delete(&self, dataspace: &str);
}

/// Fixed-width window of datapoints. The oldest falls off when a new one is
/// pushed into a full window.
struct History {
    ring: VecDeque<u64>,
    width: usize,
}

impl History {
    fn empty(width: usize) -> Self {
        let width = width.max(1);
        Self {
            ring: VecDeque::with_capacity(width),
            width,
        }
    }

    /// A window full of ones, so a dataspace nobody has asked for yet doesn't
    /// read as dead on its first fold.
    fn seeded(width: usize) -> Self {
        let mut history = Self::empty(width);
        history.ring.extend(std::iter::repeat(1).take(history.width));
        history
    }

    fn push(&mut self, datapoint: u64) {
        if self.ring.len() == self.width {
            self.ring.pop_front();
        }
        self.ring.push_back(datapoint);
    }

    /// Integer mean, rounding down.
    fn average(&self) -> Option<u64> {
        if self.ring.is_empty() {
            return None;
        }
        Some(self.ring.iter().sum::<u64>() / self.ring.len() as u64)
    }
}

#[derive(Default)]
struct Ledger {
    sizes: HashMap<String, usize>,
    loads: HashMap<String, History>,
    preferences: HashMap<String, History>,
}

/// Tracks size, load and preferred load per dataspace.
///
/// Request counters sit behind their own lock so that counting demand never
/// waits on a reader of the averaged figures.
pub struct LoadTracker {
    config: TrackerConfig,
    counters: Mutex<HashMap<String, u64>>,
    ledger: RwLock<Ledger>,
}

impl LoadTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
            ledger: RwLock::new(Ledger::default()),
        }
    }

    /// Folds every raw counter into its dataspace's load history and resets
    /// it. Dataspaces whose average load drops to zero lose their history,
    /// counter and preferences.
    pub fn fold_counters(&self) {
        let counters = std::mem::take(&mut *self.counters.lock());
        let mut ledger = self.ledger.write();
        let width = self.config.history_width;

        for dataspace in counters.keys() {
            if !ledger.loads.contains_key(dataspace) {
                ledger.loads.insert(dataspace.clone(), History::seeded(width));
            }
        }

        let mut evicted = Vec::new();
        for (dataspace, history) in ledger.loads.iter_mut() {
            history.push(counters.get(dataspace).copied().unwrap_or(0));
            if history.average() == Some(0) {
                evicted.push(dataspace.clone());
            }
        }
        for dataspace in &evicted {
            debug!(dataspace = %dataspace, "evicting idle dataspace");
            ledger.loads.remove(dataspace);
            ledger.preferences.remove(dataspace);
        }
        trace!(
            folded = counters.len(),
            evicted = evicted.len(),
            "folded request counters"
        );
    }

    /// Folds counters every `frequency_calculation_period` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.frequency_calculation_period();
        let mut interval = time::interval_at(Instant::now() + period, period);
        debug!(?period, "load tracker started");
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.fold_counters(),
            }
        }
        debug!("load tracker stopped");
    }
}

impl SwarmInfo for LoadTracker {
    fn get_size(&self, dataspace: &str) -> Option<usize> {
        self.ledger.read().sizes.get(dataspace).copied()
    }

    fn set_size(&self, dataspace: &str, size: usize) {
        self.ledger.write().sizes.insert(dataspace.to_string(), size);
    }

    fn get_load(&self, dataspace: &str) -> Option<u64> {
        self.ledger.read().loads.get(dataspace)?.average()
    }

    fn get_dataspaces(&self) -> Vec<String> {
        self.ledger.read().sizes.keys().cloned().collect()
    }

    fn increment_frequency_counter(&self, dataspace: &str) {
        *self
            .counters
            .lock()
            .entry_ref(dataspace)
            .or_insert(0) += 1;
    }

    fn add_debrief_datapoint(&self, dataspace: &str, preference: i32) {
        let Ok(preference) = u64::try_from(preference) else {
            trace!(dataspace, preference, "ignoring negative load preference");
            return;
        };
        let width = self.config.preference_history_width;
        self.ledger
            .write()
            .preferences
            .entry_ref(dataspace)
            .or_insert_with(|| History::empty(width))
            .push(preference);
    }

    fn preferred_load(&self, dataspace: &str) -> Option<u64> {
        self.ledger.read().preferences.get(dataspace)?.average()
    }

    fn delete(&self, dataspace: &str) {
        self.counters.lock().remove(dataspace);
        let mut ledger = self.ledger.write();
        ledger.sizes.remove(dataspace);
        ledger.loads.remove(dataspace);
        ledger.preferences.remove(dataspace);
    }
}
