use hashbrown::HashMap;

struct Entry {
    address: String,
    hit_score: u64,
}

/// Min-heap of cold endpoint addresses keyed by how often each was lent out.
///
/// Entries live in one vector in heap order; `index` maps every address to
/// its slot and is kept in step on every swap so that arbitrary removal is
/// O(log n). An address is held at most once.
#[derive(Default)]
pub struct InactiveQueue {
    heap: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl InactiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `address` with an explicit score. Returns false, leaving the
    /// queue untouched, if the address is already held.
    pub fn push(&mut self, address: String, hit_score: u64) -> bool {
        if self.index.contains_key(&address) {
            return false;
        }
        let slot = self.heap.len();
        self.index.insert(address.clone(), slot);
        self.heap.push(Entry { address, hit_score });
        self.sift_up(slot);
        true
    }

    /// Inserts a newly admitted address, seeding its score from the entry in
    /// the middle of the heap so it neither jumps nor trails the ranking.
    pub fn push_new(&mut self, address: String) -> bool {
        let seed = self
            .heap
            .get(self.heap.len() / 2)
            .map_or(0, |e| e.hit_score);
        self.push(address, seed)
    }

    /// Pops the least used address.
    pub fn pop(&mut self) -> Option<(String, u64)> {
        self.take(0)
    }

    pub fn remove(&mut self, address: &str) -> Option<u64> {
        let slot = *self.index.get(address)?;
        self.take(slot).map(|(_, score)| score)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    pub fn score(&self, address: &str) -> Option<u64> {
        self.index.get(address).map(|&slot| self.heap[slot].hit_score)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.heap.iter().map(|e| e.address.as_str())
    }

    /// Empties the queue in no particular order.
    pub fn drain(&mut self) -> Vec<(String, u64)> {
        self.index.clear();
        self.heap
            .drain(..)
            .map(|e| (e.address, e.hit_score))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn take(&mut self, slot: usize) -> Option<(String, u64)> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(slot, last);
        let entry = self.heap.pop()?;
        self.index.remove(&entry.address);
        if slot < self.heap.len() {
            // the moved-in entry may belong above or below its new slot
            self.sift_down(slot);
            self.sift_up(slot);
        }
        Some((entry.address, entry.hit_score))
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].address.clone(), a);
        self.index.insert(self.heap[b].address.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[parent].hit_score <= self.heap[slot].hit_score {
                break;
            }
            self.swap(parent, slot);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < self.heap.len()
                && self.heap[left].hit_score < self.heap[smallest].hit_score
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.heap[right].hit_score < self.heap[smallest].hit_score
            {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}
