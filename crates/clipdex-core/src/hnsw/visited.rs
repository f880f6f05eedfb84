//! Epoch-stamped visited set
//!
//! `clear()` bumps an epoch instead of zeroing memory, so one set can be
//! reused across every layer of a search.

pub struct VisitedSet {
    epochs: Vec<u32>,
    current: u32,
}

impl VisitedSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: vec![0; capacity.max(16)],
            current: 1,
        }
    }

    #[inline(always)]
    pub fn is_visited(&self, id: usize) -> bool {
        id < self.epochs.len() && self.epochs[id] == self.current
    }

    /// Marks `id`; returns true if it was not yet visited.
    #[inline(always)]
    pub fn visit(&mut self, id: usize) -> bool {
        if id >= self.epochs.len() {
            let len = (id + 1).next_power_of_two();
            self.epochs.resize(len, 0);
        }
        if self.epochs[id] == self.current {
            return false;
        }
        self.epochs[id] = self.current;
        true
    }

    pub fn clear(&mut self) {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.epochs.fill(0);
            self.current = 1;
        }
    }
}
