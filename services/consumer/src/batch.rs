//! Batch accumulation: up to `batch_size` items, or `batch_timeout` since
//! the first item of the current batch, whichever comes first.

use std::time::{Duration, Instant};

pub struct BatchAccumulator<T> {
    items: Vec<T>,
    first_at: Option<Instant>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl<T> BatchAccumulator<T> {
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        BatchAccumulator {
            items: Vec::with_capacity(batch_size),
            first_at: None,
            batch_size: batch_size.max(1),
            batch_timeout,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.is_empty() {
            self.first_at = Some(Instant::now());
        }
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Ready to flush: full, or the timeout has elapsed since the first
    /// item arrived.
    pub fn is_ripe(&self) -> bool {
        if self.items.len() >= self.batch_size {
            return true;
        }
        match self.first_at {
            Some(first) => first.elapsed() >= self.batch_timeout,
            None => false,
        }
    }

    /// How long the worker may wait for more input before a flush is due.
    /// `None` when the accumulator is empty (wait indefinitely for input).
    pub fn time_to_deadline(&self) -> Option<Duration> {
        if self.items.len() >= self.batch_size {
            return Some(Duration::ZERO);
        }
        self.first_at
            .map(|first| self.batch_timeout.saturating_sub(first.elapsed()))
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.first_at = None;
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ripe_at_size() {
        let mut batch = BatchAccumulator::new(2, Duration::from_secs(60));
        batch.push(1);
        assert!(!batch.is_ripe());
        batch.push(2);
        assert!(batch.is_ripe());
        assert_eq!(batch.time_to_deadline(), Some(Duration::ZERO));
    }

    #[test]
    fn ripe_at_timeout() {
        let mut batch = BatchAccumulator::new(100, Duration::from_millis(10));
        batch.push(1);
        assert!(!batch.is_ripe());
        std::thread::sleep(Duration::from_millis(15));
        assert!(batch.is_ripe());
    }

    #[test]
    fn empty_batch_has_no_deadline() {
        let batch: BatchAccumulator<u8> = BatchAccumulator::new(10, Duration::from_secs(1));
        assert!(batch.time_to_deadline().is_none());
        assert!(!batch.is_ripe());
    }

    #[test]
    fn drain_resets_the_window() {
        let mut batch = BatchAccumulator::new(10, Duration::from_millis(10));
        batch.push(1);
        assert_eq!(batch.drain(), vec![1]);
        assert!(batch.is_empty());
        assert!(batch.time_to_deadline().is_none());
    }
}
