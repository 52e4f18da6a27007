//! Decides where endpoints should go.
//!
//! Every dataspace has a fit distance: its current size minus the size its
//! load justifies. Negative means starved, positive means surplus. The
//! analyzer keeps these sorted ascending and proposes transfers from the
//! surplus end to the starved end until no starved dataspace faces a surplus
//! one.
//!
//! Whole swarms are judged by a fit score in `[0, 1]` derived from the same
//! distance, where 0.5 is a perfect fit. Far-off swarms that are big enough
//! become split candidates; a starved and an oversized swarm whose scores
//! cancel out become a merge candidate.

use std::{cmp::Ordering, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    select,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{config::AnalyzerConfig, tracker::SwarmInfo, Error::*, Result, SwarmId};

/// Maps a dataspace's load to the number of members it should have.
pub trait OptimalSizeFinder: Send + Sync {
    fn optimal_size(&self, dataspace: &str, load: u64) -> u64;
}

/// Sizes dataspaces so that each member carries the load its peers said they
/// prefer.
pub struct PreferredLoadFinder {
    info: Arc<dyn SwarmInfo>,
    default_preferred_load: u64,
}

impl PreferredLoadFinder {
    pub fn new(info: Arc<dyn SwarmInfo>, default_preferred_load: u64) -> Self {
        Self {
            info,
            default_preferred_load: default_preferred_load.max(1),
        }
    }
}

impl OptimalSizeFinder for PreferredLoadFinder {
    fn optimal_size(&self, dataspace: &str, load: u64) -> u64 {
        let per_member = match self.info.preferred_load(dataspace) {
            Some(preferred) if preferred > 0 => preferred,
            _ => self.default_preferred_load,
        };
        load / per_member
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchDistance {
    pub dataspace: String,
    pub distance: i64,
}

/// One swarm as the swarm map sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmLayout {
    pub id: SwarmId,
    pub size: usize,
    pub dataspaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Move `size` endpoints from the swarm serving `transferer` to the one
    /// serving `transferee`.
    Transfer {
        transferer: String,
        transferee: String,
        size: usize,
    },
    Split {
        swarm: SwarmId,
        placement_one: Vec<String>,
        placement_two: Vec<String>,
    },
    Merge {
        swarms: [SwarmId; 2],
    },
}

pub struct FitAnalyzer {
    config: AnalyzerConfig,
    info: Arc<dyn SwarmInfo>,
    finder: Arc<dyn OptimalSizeFinder>,
    distances: Mutex<Vec<MatchDistance>>,
}

impl FitAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        info: Arc<dyn SwarmInfo>,
        finder: Arc<dyn OptimalSizeFinder>,
    ) -> Self {
        Self {
            config,
            info,
            finder,
            distances: Mutex::new(Vec::new()),
        }
    }

    /// Builds an analyzer sized by peer preferences.
    pub fn with_preferred_loads(
        config: AnalyzerConfig,
        info: Arc<dyn SwarmInfo>,
    ) -> Self {
        let finder = Arc::new(PreferredLoadFinder::new(
            info.clone(),
            config.default_preferred_load,
        ));
        Self::new(config, info, finder)
    }

    fn distance(&self, dataspace: &str, size: usize) -> i64 {
        let load = self.info.get_load(dataspace).unwrap_or(0);
        size as i64 - self.finder.optimal_size(dataspace, load) as i64
    }

    /// Recomputes every dataspace's distance from the tracker.
    pub fn refresh_distances(&self) {
        let mut fresh: Vec<MatchDistance> = self
            .info
            .get_dataspaces()
            .into_iter()
            .map(|dataspace| {
                let size = self.info.get_size(&dataspace).unwrap_or(0);
                let distance = self.distance(&dataspace, size);
                MatchDistance {
                    dataspace,
                    distance,
                }
            })
            .collect();
        fresh.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.dataspace.cmp(&b.dataspace))
        });
        trace!(dataspaces = fresh.len(), "refreshed fit distances");
        *self.distances.lock() = fresh;
    }

    /// Refreshes distances every `distance_poll_time` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.distance_poll_time();
        let mut interval = time::interval_at(Instant::now() + period, period);
        debug!(?period, "fit analyzer started");
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.refresh_distances(),
            }
        }
        debug!("fit analyzer stopped");
    }

    pub fn distances(&self) -> Vec<MatchDistance> {
        self.distances.lock().clone()
    }

    /// Pairs the most starved dataspace with the most oversized one and
    /// transfers as many endpoints as the smaller imbalance allows, until the
    /// extremes no longer straddle zero. Planned transfers are applied to the
    /// stored distances, so the next `most_needy` already accounts for them.
    pub fn calculate_candidates(&self) -> Vec<Candidate> {
        let mut distances = self.distances.lock();
        let mut candidates = Vec::new();
        while distances.len() >= 2 {
            let last = distances.len() - 1;
            let (needy, donor) = (distances[0].distance, distances[last].distance);
            if !(needy < 0 && donor > 0) {
                break;
            }
            let size = needy.abs().min(donor);
            candidates.push(Candidate::Transfer {
                transferer: distances[last].dataspace.clone(),
                transferee: distances[0].dataspace.clone(),
                size: size as usize,
            });
            distances[0].distance += size;
            distances[last].distance -= size;
            adjust_ordering(&mut distances);
        }
        debug!(candidates = candidates.len(), "calculated transfer candidates");
        candidates
    }

    /// The dataspace furthest below its justified size.
    pub fn most_needy(&self) -> Result<String> {
        match self.distances.lock().first() {
            Some(head) if head.distance < 0 => Ok(head.dataspace.clone()),
            _ => Err(NoNeedyDataspace),
        }
    }

    /// Applies a membership change to the stored distances ahead of the next
    /// refresh, so consecutive joiners don't all land on the same dataspace.
    pub fn credit(&self, dataspace: &str, delta: i64) {
        let mut distances = self.distances.lock();
        if let Some(entry) = distances.iter_mut().find(|d| d.dataspace == dataspace) {
            entry.distance += delta;
            distances.sort_by(|a, b| {
                a.distance
                    .cmp(&b.distance)
                    .then_with(|| a.dataspace.cmp(&b.dataspace))
            });
        }
    }

    /// `0.5` for a swarm exactly as big as its load justifies, approaching
    /// `0` when starved and `1` when oversized.
    pub fn fit_score(&self, distance: i64) -> f64 {
        let magnitude = distance.unsigned_abs() as f64;
        let metric = magnitude / (magnitude + self.config.increment_modifier as f64);
        match distance.cmp(&0) {
            Ordering::Less => 0.5 - metric / 2.0,
            Ordering::Equal => 0.5,
            Ordering::Greater => 0.5 + metric / 2.0,
        }
    }

    fn swarm_distance(&self, layout: &SwarmLayout) -> i64 {
        let optimal: u64 = layout
            .dataspaces
            .iter()
            .map(|ds| {
                let load = self.info.get_load(ds).unwrap_or(0);
                self.finder.optimal_size(ds, load)
            })
            .sum();
        layout.size as i64 - optimal as i64
    }

    fn is_valid_split(&self, fit: f64, layout: &SwarmLayout) -> bool {
        layout.size >= self.config.split_size_limit
            && layout.dataspaces.len() >= 2
            && (fit - 0.5).abs() > self.config.split_validity_limit
    }

    fn is_valid_merge(&self, fit_one: f64, fit_two: f64) -> bool {
        let straddles = (fit_one - 0.5) * (fit_two - 0.5) < 0.0;
        straddles && (1.0 - (fit_one + fit_two)).abs() < self.config.merge_validity_limit
    }

    /// Proposes splits and merges over whole swarms. Swarms are sorted by fit
    /// and walked from both ends at once; each step splits the worst-fitting
    /// end if it qualifies, else merges the two ends if they cancel out.
    pub fn calculate_structural_candidates(
        &self,
        layouts: &[SwarmLayout],
    ) -> Vec<Candidate> {
        let mut fits: Vec<(f64, &SwarmLayout)> = layouts
            .iter()
            .map(|layout| (self.fit_score(self.swarm_distance(layout)), layout))
            .collect();
        fits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let mut candidates = Vec::new();
        if fits.is_empty() {
            return candidates;
        }
        let (mut start, mut end) = (0, fits.len() - 1);
        while start <= end {
            let (start_fit, start_layout) = fits[start];
            let (end_fit, end_layout) = fits[end];
            if self.is_valid_split(start_fit, start_layout) {
                candidates.push(self.split_candidate(start_layout));
            } else if self.is_valid_split(end_fit, end_layout) {
                candidates.push(self.split_candidate(end_layout));
            } else if start != end && self.is_valid_merge(start_fit, end_fit) {
                candidates.push(Candidate::Merge {
                    swarms: [start_layout.id, end_layout.id],
                });
            }
            if end == 0 {
                break;
            }
            start += 1;
            end -= 1;
        }
        debug!(candidates = candidates.len(), "calculated structural candidates");
        candidates
    }

    fn split_candidate(&self, layout: &SwarmLayout) -> Candidate {
        let loads: Vec<(String, u64)> = layout
            .dataspaces
            .iter()
            .map(|ds| (ds.clone(), self.info.get_load(ds).unwrap_or(0)))
            .collect();
        let (placement_one, placement_two) = split_placements(loads);
        Candidate::Split {
            swarm: layout.id,
            placement_one,
            placement_two,
        }
    }
}

/// Restores ascending order after only the head grew and only the tail
/// shrank. One bubble pass from each end is enough.
fn adjust_ordering(distances: &mut [MatchDistance]) {
    let mut i = 0;
    while i + 1 < distances.len() && distances[i].distance > distances[i + 1].distance {
        distances.swap(i, i + 1);
        i += 1;
    }
    let mut j = distances.len().saturating_sub(1);
    while j > 0 && distances[j - 1].distance > distances[j].distance {
        distances.swap(j - 1, j);
        j -= 1;
    }
}

/// Divides dataspaces into two groups of similar total load. The two busiest
/// seed the groups, then each next busiest joins the lighter group.
pub fn split_placements(mut loads: Vec<(String, u64)>) -> (Vec<String>, Vec<String>) {
    loads.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let (mut one, mut two) = (Vec::new(), Vec::new());
    let (mut load_one, mut load_two) = (0u64, 0u64);
    let mut loads = loads.into_iter();
    if let Some((dataspace, load)) = loads.next() {
        load_one = load;
        one.push(dataspace);
    }
    if let Some((dataspace, load)) = loads.next() {
        load_two = load;
        two.push(dataspace);
    }
    for (dataspace, load) in loads {
        if load_one <= load_two {
            load_one += load;
            one.push(dataspace);
        } else {
            load_two += load;
            two.push(dataspace);
        }
    }
    (one, two)
}
