//! Lazy synchronization
//!
//! Outgoing deltas are not pushed on every mutation. A [`LazySync`] policy
//! counts pending deltas and asks for a flush once the count threshold is
//! reached or the oldest pending delta has waited for the flush interval.

use crate::config::BatchingConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Flush policy for pending outgoing deltas
#[derive(Debug, Clone)]
pub struct LazySync {
    max_deltas: usize,
    flush_interval: Duration,
    pending: usize,
    oldest: Option<Instant>,
}

impl LazySync {
    pub fn new(max_deltas: usize, flush_interval: Duration) -> Self {
        Self {
            max_deltas: max_deltas.max(1),
            flush_interval,
            pending: 0,
            oldest: None,
        }
    }

    pub fn from_config(config: &BatchingConfig) -> Self {
        Self::new(
            config.max_deltas,
            Duration::from_millis(config.flush_interval_ms),
        )
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Note `count` new deltas; returns true when the batch is full
    pub fn observe(&mut self, count: usize, now: Instant) -> bool {
        if count == 0 {
            return false;
        }
        self.pending += count;
        self.oldest.get_or_insert(now);
        self.pending >= self.max_deltas
    }

    /// Whether pending deltas have waited long enough
    pub fn is_due(&self, now: Instant) -> bool {
        self.oldest
            .map_or(false, |oldest| now.duration_since(oldest) >= self.flush_interval)
    }

    /// Reset after the pending deltas were handed to the network
    pub fn flushed(&mut self) {
        self.pending = 0;
        self.oldest = None;
    }
}

/// Split `items` into consecutive chunks whose summed size stays within
/// `max_bytes`; an item larger than the budget travels alone
pub fn split_by_budget<T>(items: Vec<T>, max_bytes: usize, size: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for item in items {
        let item_size = size(&item);
        if !current.is_empty() && used + item_size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += item_size;
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_count() {
        let now = Instant::now();
        let mut lazy = LazySync::new(3, Duration::from_secs(60));
        assert!(!lazy.observe(2, now));
        assert!(lazy.observe(1, now));
        lazy.flushed();
        assert_eq!(lazy.pending(), 0);
        assert!(!lazy.is_due(now + Duration::from_secs(120)));
    }

    #[test]
    fn test_flush_on_timer() {
        let now = Instant::now();
        let mut lazy = LazySync::new(100, Duration::from_millis(250));
        lazy.observe(1, now);
        assert!(!lazy.is_due(now + Duration::from_millis(100)));
        assert!(lazy.is_due(now + Duration::from_millis(250)));
    }

    #[test]
    fn test_timer_runs_from_oldest_delta() {
        let now = Instant::now();
        let mut lazy = LazySync::new(100, Duration::from_millis(250));
        lazy.observe(1, now);
        lazy.observe(1, now + Duration::from_millis(200));
        assert!(lazy.is_due(now + Duration::from_millis(260)));
    }

    #[test]
    fn test_split_by_budget() {
        let chunks = split_by_budget(vec![40, 40, 40, 200, 10], 100, |n| *n);
        assert_eq!(chunks, vec![vec![40, 40], vec![40], vec![200], vec![10]]);
        assert!(split_by_budget(Vec::<usize>::new(), 100, |n| *n).is_empty());
    }
}
