//! Fixed-length FIFO window over the most recent batches.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::collections::vec_deque;

/// Keeps the last `length` values; pushing into a full window evicts the oldest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindow<T> {
    length: usize,
    values: VecDeque<T>,
}

impl<T> SlidingWindow<T> {
    /// A window of at least one slot.
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
            values: VecDeque::with_capacity(length.max(1)),
        }
    }

    /// The same window with a new length, keeping the most recent values.
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length.max(1);
        while self.values.len() > self.length {
            self.values.pop_front();
        }
        self
    }

    /// Append a value, returning the evicted one when the window was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        self.values.push_back(value);
        if self.values.len() > self.length {
            self.values.pop_front()
        } else {
            None
        }
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.values.iter()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.length
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl SlidingWindow<f64> {
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }
}

impl<'a, T> IntoIterator for &'a SlidingWindow<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
