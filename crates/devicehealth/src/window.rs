//! Fixed-capacity sliding windows.

use std::collections::VecDeque;

/// FIFO of the most recent `capacity` samples. Pushing into a full window
/// evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    /// Create an empty window. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted one if the window was full.
    pub fn push(&mut self, sample: T) -> Option<T> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl SlidingWindow<f64> {
    /// Arithmetic mean, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Sample standard deviation (n - 1 denominator), `None` below two samples.
    pub fn sample_stddev(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let mean = self.mean()?;
        let sum_sq: f64 = self.samples.iter().map(|x| (x - mean).powi(2)).sum();
        Some((sum_sq / (n - 1) as f64).sqrt())
    }

    /// Number of samples strictly above `ceiling`.
    pub fn count_above(&self, ceiling: f64) -> usize {
        self.samples.iter().filter(|&&x| x > ceiling).count()
    }
}
