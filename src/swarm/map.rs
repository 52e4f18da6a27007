//! The directory of swarms.
//!
//! Every registered dataspace maps to exactly one swarm, and every swarm
//! knows which dataspaces it serves. Both directions are changed together
//! under one write lock, so nobody can observe a dataspace owned by two
//! swarms or by none. Network work (bisecting and stitching pools) happens
//! before the lock is taken; only the bookkeeping happens under it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use super::{
    analyzer::SwarmLayout,
    manager::{SwarmManager, SwarmManagerGenerator},
    Error::*,
    Result,
    SwarmId,
};

struct SwarmEntry {
    manager: Arc<SwarmManager>,
    dataspaces: Vec<String>,
}

#[derive(Default)]
struct Directory {
    dataspaces: HashMap<String, SwarmId>,
    swarms: HashMap<SwarmId, SwarmEntry>,
}

impl Directory {
    fn entry(&self, id: SwarmId) -> Result<&SwarmEntry> {
        self.swarms.get(&id).ok_or(UnknownSwarm(id))
    }

    fn swarm_of(&self, dataspace: &str) -> Result<SwarmId> {
        self.dataspaces
            .get(dataspace)
            .copied()
            .ok_or_else(|| UnknownDataspace(dataspace.to_string()))
    }
}

pub struct SwarmMap {
    generator: SwarmManagerGenerator,
    directory: RwLock<Directory>,
    next_id: AtomicU64,
}

impl SwarmMap {
    pub fn new(generator: SwarmManagerGenerator) -> Self {
        Self {
            generator,
            directory: RwLock::new(Directory::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SwarmId {
        SwarmId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a dataspace under a new, empty swarm.
    pub async fn add_swarm(&self, dataspace: &str) -> Result<SwarmId> {
        let (id, manager) = {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            if directory.dataspaces.contains_key(dataspace) {
                Err(DataspaceAlreadyRegistered(dataspace.to_string()))?
            }
            let id = self.next_id();
            let manager = Arc::new(self.generator.generate(id));
            directory.dataspaces.insert(dataspace.to_string(), id);
            manager.assign(vec![dataspace.to_string()]);
            directory.swarms.insert(
                id,
                SwarmEntry {
                    manager: manager.clone(),
                    dataspaces: vec![dataspace.to_string()],
                },
            );
            (id, manager)
        };
        manager.publish_size().await;
        info!(dataspace, swarm = %id, "registered dataspace");
        Ok(id)
    }

    /// Serves an additional dataspace from an existing swarm.
    pub async fn add_dataspace(&self, swarm: SwarmId, dataspace: &str) -> Result<()> {
        let manager = {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            if directory.dataspaces.contains_key(dataspace) {
                Err(DataspaceAlreadyRegistered(dataspace.to_string()))?
            }
            let entry = directory
                .swarms
                .get_mut(&swarm)
                .ok_or(UnknownSwarm(swarm))?;
            entry.dataspaces.push(dataspace.to_string());
            entry.manager.assign(entry.dataspaces.clone());
            let manager = entry.manager.clone();
            directory.dataspaces.insert(dataspace.to_string(), swarm);
            manager
        };
        manager.publish_size().await;
        Ok(())
    }

    /// Deregisters a dataspace. A swarm left serving nothing is closed.
    pub async fn remove_swarm(&self, dataspace: &str) -> Result<()> {
        let (manager, emptied) = {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            let id = directory.swarm_of(dataspace)?;
            directory.dataspaces.remove(dataspace);
            let entry = directory.swarms.get_mut(&id).ok_or(UnknownSwarm(id))?;
            entry.dataspaces.retain(|ds| ds != dataspace);
            entry.manager.assign(entry.dataspaces.clone());
            let manager = entry.manager.clone();
            let emptied = entry.dataspaces.is_empty();
            if emptied {
                directory.swarms.remove(&id);
            }
            self.generator.info().delete(dataspace);
            (manager, emptied)
        };
        if emptied {
            if let Err(e) = manager.close().await {
                warn!(swarm = %manager.id(), error = %e, "failed to close emptied swarm");
            }
        } else {
            manager.publish_size().await;
        }
        info!(dataspace, "deregistered dataspace");
        Ok(())
    }

    /// The manager of the swarm serving `dataspace`.
    pub async fn get_swarm(&self, dataspace: &str) -> Result<Arc<SwarmManager>> {
        let directory = self.directory.read().await;
        let id = directory.swarm_of(dataspace)?;
        Ok(directory.entry(id)?.manager.clone())
    }

    pub async fn get_swarm_id(&self, dataspace: &str) -> Result<SwarmId> {
        self.directory.read().await.swarm_of(dataspace)
    }

    pub async fn get_swarm_manager(&self, swarm: SwarmId) -> Result<Arc<SwarmManager>> {
        Ok(self.directory.read().await.entry(swarm)?.manager.clone())
    }

    pub async fn get_dataspaces(&self, swarm: SwarmId) -> Result<Vec<String>> {
        Ok(self.directory.read().await.entry(swarm)?.dataspaces.clone())
    }

    pub async fn swarm_count(&self) -> usize {
        self.directory.read().await.swarms.len()
    }

    /// A snapshot of every swarm, its size and the dataspaces it serves.
    pub async fn layout(&self) -> Vec<SwarmLayout> {
        let swarms: Vec<_> = {
            let directory = self.directory.read().await;
            directory
                .swarms
                .iter()
                .map(|(id, entry)| (*id, entry.manager.clone(), entry.dataspaces.clone()))
                .collect()
        };
        let mut layout = Vec::with_capacity(swarms.len());
        for (id, manager, dataspaces) in swarms {
            layout.push(SwarmLayout {
                id,
                size: manager.total_endpoints().await,
                dataspaces,
            });
        }
        layout.sort_by_key(|l| l.id);
        layout
    }

    /// Splits a swarm in two. Dataspaces named in `placement_one` stay,
    /// those in `placement_two` move to the new swarm, and any others go to
    /// whichever side has fewer so far. Returns the ids of both halves.
    ///
    /// The pool is bisected before the directory is locked, so the sides are
    /// placed again at commit time against what the swarm serves by then. If
    /// that leaves a side empty the new half is folded back in and the split
    /// fails with `EmptyPlacement`.
    pub async fn split(
        &self,
        swarm: SwarmId,
        placement_one: &[String],
        placement_two: &[String],
    ) -> Result<(SwarmId, SwarmId)> {
        let (manager, dataspaces) = {
            let directory = self.directory.read().await;
            let entry = directory.entry(swarm)?;
            (entry.manager.clone(), entry.dataspaces.clone())
        };
        let (one, two) = place_dataspaces(&dataspaces, placement_one, placement_two);
        if one.is_empty() || two.is_empty() {
            Err(EmptyPlacement(swarm))?
        }

        let new_id = self.next_id();
        let new_manager = Arc::new(manager.bisect(new_id).await?);

        let committed = {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            match directory.swarms.get_mut(&swarm) {
                None => Err(UnknownSwarm(swarm)),
                Some(entry) => {
                    let (one, two) = place_dataspaces(&entry.dataspaces, &one, &two);
                    if one.is_empty() || two.is_empty() {
                        Err(EmptyPlacement(swarm))
                    } else {
                        entry.dataspaces = one.clone();
                        entry.manager.assign(one);
                        for dataspace in &two {
                            directory.dataspaces.insert(dataspace.clone(), new_id);
                        }
                        new_manager.assign(two.clone());
                        directory.swarms.insert(
                            new_id,
                            SwarmEntry {
                                manager: new_manager.clone(),
                                dataspaces: two,
                            },
                        );
                        Ok(())
                    }
                }
            }
        };
        if let Err(e) = committed {
            fold_back(&manager, &new_manager).await;
            return Err(e);
        }

        manager.publish_size().await;
        new_manager.publish_size().await;
        info!(swarm = %swarm, new_swarm = %new_id, "split swarm");
        Ok((swarm, new_id))
    }

    /// Merges the second swarm into the first. Returns the surviving id.
    pub async fn merge(&self, swarms: [SwarmId; 2]) -> Result<SwarmId> {
        let [keep, retire] = swarms;
        if keep == retire {
            Err(SelfReference("merge"))?
        }
        let (keeper, retiree) = {
            let directory = self.directory.read().await;
            (
                directory.entry(keep)?.manager.clone(),
                directory.entry(retire)?.manager.clone(),
            )
        };
        keeper.stitch(&retiree).await?;

        {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            let retired = directory
                .swarms
                .remove(&retire)
                .map(|entry| entry.dataspaces)
                .unwrap_or_default();
            for dataspace in &retired {
                directory.dataspaces.insert(dataspace.clone(), keep);
            }
            let entry = directory.swarms.get_mut(&keep).ok_or(UnknownSwarm(keep))?;
            entry.dataspaces.extend(retired);
            entry.manager.assign(entry.dataspaces.clone());
        }
        keeper.publish_size().await;
        info!(swarm = %keep, retired = %retire, "merged swarms");
        Ok(keep)
    }

    /// Closes every swarm and empties the directory.
    pub async fn close_all(&self) {
        let swarms: Vec<_> = {
            let mut guard = self.directory.write().await;
            let directory = &mut *guard;
            directory.dataspaces.clear();
            directory.swarms.drain().map(|(_, entry)| entry.manager).collect()
        };
        for manager in swarms {
            if let Err(e) = manager.close().await {
                debug!(swarm = %manager.id(), error = %e, "swarm already closed");
            }
        }
    }
}

/// Returns a bisected half to the swarm it came from. If that swarm has
/// been closed in the meantime the half is closed too.
async fn fold_back(manager: &SwarmManager, half: &SwarmManager) {
    if let Err(e) = manager.stitch(half).await {
        debug!(swarm = %manager.id(), error = %e, "could not fold split half back");
        if let Err(e) = half.close().await {
            trace!(swarm = %half.id(), error = %e, "split half was already closed");
        }
    }
}

fn place_dataspaces(
    dataspaces: &[String],
    placement_one: &[String],
    placement_two: &[String],
) -> (Vec<String>, Vec<String>) {
    let (mut one, mut two) = (Vec::new(), Vec::new());
    for dataspace in dataspaces {
        if placement_one.contains(dataspace) {
            one.push(dataspace.clone());
        } else if placement_two.contains(dataspace) {
            two.push(dataspace.clone());
        } else if one.len() < two.len() {
            one.push(dataspace.clone());
        } else {
            two.push(dataspace.clone());
        }
    }
    (one, two)
}
