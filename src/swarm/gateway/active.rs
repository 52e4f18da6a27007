use std::collections::VecDeque;

use crate::swarm::{Error::*, Result};

/// A bounded FIFO ring. Pushing into a full queue is an error, never a
/// silent drop; room is only made by [`ActiveQueue::grow`] or
/// [`ActiveQueue::resize`].
pub struct ActiveQueue<T> {
    ring: VecDeque<T>,
    capacity: usize,
}

impl<T> ActiveQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        if self.is_full() {
            Err(ActiveQueueFull)?
        }
        self.ring.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.ring.pop_front()
    }

    /// Removes the first entry matching `pred`, keeping the order of the
    /// rest.
    pub fn remove_where(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let idx = self.ring.iter().position(pred)?;
        self.ring.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.ring.iter()
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.ring.drain(..).collect()
    }

    /// Doubles the capacity.
    pub fn grow(&mut self) {
        self.capacity = (self.capacity * 2).max(1);
        self.ring.reserve(self.capacity - self.ring.len());
    }

    /// Changes the capacity without losing entries. Shrinking below the
    /// number of held entries, or to zero, fails.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            Err(ZeroCapacity)?
        }
        if capacity < self.ring.len() {
            Err(ResizeBelowSize {
                capacity,
                size: self.ring.len(),
            })?
        }
        self.capacity = capacity;
        if capacity > self.ring.capacity() {
            self.ring.reserve(capacity - self.ring.len());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
