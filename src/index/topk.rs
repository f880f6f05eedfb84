//! Bounded top-k collector.
//!
//! A min-heap of size `k` whose root is the current worst kept entry. An
//! entry is better than another when its score is higher, or when scores are
//! equal and its key sorts first. That total order makes the final ranking
//! independent of scan order, so partial collectors built in parallel can be
//! merged without changing the result.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct Entry<K> {
    score: f32,
    key: K,
}

impl<K: Ord> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for Entry<K> {}

impl<K: Ord> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Entry<K> {
    /// Reversed so `BinaryHeap` pops the worst entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.key.cmp(&other.key))
    }
}

#[derive(Debug, Clone)]
pub struct TopK<K> {
    k: usize,
    heap: BinaryHeap<Entry<K>>,
}

impl<K: Ord> TopK<K> {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Score of the worst kept entry once the collector is full.
    pub fn threshold(&self) -> Option<f32> {
        if self.heap.len() < self.k {
            None
        } else {
            self.heap.peek().map(|e| e.score)
        }
    }

    /// Offer a candidate. NaN scores are dropped.
    pub fn push(&mut self, key: K, score: f32) {
        if self.k == 0 || score.is_nan() {
            return;
        }
        let entry = Entry { score, key };
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            // `entry < worst` in heap order means entry ranks better.
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        for entry in other.heap {
            self.push(entry.key, entry.score);
        }
        self
    }

    /// Drain into `(key, score)` pairs, best first.
    pub fn into_sorted(self) -> Vec<(K, f32)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|e| (e.key, e.score))
            .collect()
    }
}
