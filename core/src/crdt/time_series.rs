//! TimeSeriesCRDT: replicated metric stream with mergeable window aggregates
//!
//! Entries are `(timestamp, replica, counter) -> value` records stored with
//! OR-Set semantics: each insert carries a fresh tag, retention removes only
//! observed entries. The map is keyed so that iteration is already the
//! display order, `(timestamp, replica)` with the counter as final tie-break.
//!
//! Window aggregates are cached per tracked window size as
//! [`PartialAggregate`]s. Merge folds only the entries that are new to this
//! replica into the cache, and buckets that lose entries to tombstones are
//! recomputed from the entry range. The cache is derived state: it is never
//! serialized and never merged by last-write-wins.
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{AggregateFn, Crdt, TimeSeriesCrdt};
//!
//! let mut a = TimeSeriesCrdt::new();
//! let mut b = TimeSeriesCrdt::new();
//! a.track_window(60);
//! a.insert(10, 2.0, "n1").unwrap();
//! b.insert(20, 4.0, "n2").unwrap();
//!
//! a.merge(&b);
//! let windows = a.aggregate(60, AggregateFn::Avg);
//! assert_eq!(windows[0].value, 3.0);
//! ```

use super::Crdt;
use crate::error::{Result, SyncError};
use crate::sync::{Timestamp, VectorClock};
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Position of an entry in the series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub timestamp: Timestamp,
    pub replica: ReplicaId,
    pub counter: u64,
}

/// A live entry in the sorted view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub replica: ReplicaId,
    pub value: f64,
}

/// Aggregation function applied per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// Associative, commutative partial aggregate
///
/// Combining the partials of two disjoint entry sets equals the partial of
/// their union, which is what lets merge update windows incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for PartialAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl PartialAggregate {
    pub fn from_value(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    /// Fold another partial into this one
    pub fn combine(&mut self, other: &PartialAggregate) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Final value for an aggregation function (`None` for an empty partial)
    pub fn finish(&self, func: AggregateFn) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(match func {
            AggregateFn::Count => self.count as f64,
            AggregateFn::Sum => self.sum,
            AggregateFn::Avg => self.sum / self.count as f64,
            AggregateFn::Min => self.min,
            AggregateFn::Max => self.max,
        })
    }
}

/// Result of aggregating one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowValue {
    /// Inclusive window start
    pub start: Timestamp,
    /// Exclusive window end, saturating at `Timestamp::MAX`
    pub end: Timestamp,
    pub count: u64,
    pub value: f64,
}

/// Replicated time series
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "TimeSeriesState", into = "TimeSeriesState")]
pub struct TimeSeriesCrdt {
    entries: BTreeMap<EntryKey, f64>,
    tombstones: BTreeSet<EntryKey>,
    context: VectorClock,
    windows: BTreeSet<u64>,
    cache: BTreeMap<u64, BTreeMap<u64, PartialAggregate>>,
}

/// Serialized shape: everything except the aggregate cache
#[derive(Serialize, Deserialize)]
struct TimeSeriesState {
    #[serde(with = "super::pairs")]
    entries: BTreeMap<EntryKey, f64>,
    tombstones: BTreeSet<EntryKey>,
    context: VectorClock,
    windows: BTreeSet<u64>,
}

impl From<TimeSeriesState> for TimeSeriesCrdt {
    fn from(state: TimeSeriesState) -> Self {
        let mut series = TimeSeriesCrdt {
            entries: state.entries,
            tombstones: state.tombstones,
            context: state.context,
            windows: state.windows,
            cache: BTreeMap::new(),
        };
        series.rebuild_cache();
        series
    }
}

impl From<TimeSeriesCrdt> for TimeSeriesState {
    fn from(series: TimeSeriesCrdt) -> Self {
        TimeSeriesState {
            entries: series.entries,
            tombstones: series.tombstones,
            context: series.context,
            windows: series.windows,
        }
    }
}

impl PartialEq for TimeSeriesCrdt {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
            && self.tombstones == other.tombstones
            && self.context == other.context
            && self.windows == other.windows
    }
}

impl TimeSeriesCrdt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tagged entry
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for NaN values, which would break both
    /// equality and min/max aggregation.
    pub fn insert(
        &mut self,
        timestamp: Timestamp,
        value: f64,
        replica: &str,
    ) -> Result<TimeSeriesCrdt> {
        if value.is_nan() {
            return Err(SyncError::InvalidOperation(
                "time series values must not be NaN".to_string(),
            ));
        }

        let counter = self.context.tick(replica);
        let key = EntryKey {
            timestamp,
            replica: replica.to_string(),
            counter,
        };
        self.entries.insert(key.clone(), value);
        self.fold_into_cache(&key, value);

        let mut delta = TimeSeriesCrdt::new();
        delta.entries.insert(key, value);
        delta.context.update(replica, counter);
        Ok(delta)
    }

    /// Remove every live entry older than `cutoff`
    ///
    /// Only entries observed here are tombstoned; entries inserted
    /// concurrently elsewhere survive.
    pub fn remove_before(&mut self, cutoff: Timestamp) -> Option<TimeSeriesCrdt> {
        let doomed: Vec<EntryKey> = self
            .entries
            .keys()
            .take_while(|key| key.timestamp < cutoff)
            .filter(|key| !self.tombstones.contains(*key))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return None;
        }

        let mut delta = TimeSeriesCrdt::new();
        for key in &doomed {
            self.tombstones.insert(key.clone());
            delta.tombstones.insert(key.clone());
        }
        self.recompute_buckets(doomed.iter().map(|key| key.timestamp));
        Some(delta)
    }

    /// Start maintaining a cached aggregate for windows of `size` time units
    ///
    /// Tracked windows replicate as a grow-only set.
    pub fn track_window(&mut self, size: u64) -> Option<TimeSeriesCrdt> {
        if size == 0 || !self.windows.insert(size) {
            return None;
        }
        self.build_window(size);

        let mut delta = TimeSeriesCrdt::new();
        delta.windows.insert(size);
        Some(delta)
    }

    pub fn tracked_windows(&self) -> impl Iterator<Item = &u64> {
        self.windows.iter()
    }

    /// Aggregate live entries into fixed windows of `window` time units
    ///
    /// Served from the cache when the window size is tracked, computed from
    /// the entries otherwise. Windows without entries are omitted.
    pub fn aggregate(&self, window: u64, func: AggregateFn) -> Vec<WindowValue> {
        if window == 0 {
            return Vec::new();
        }

        let computed;
        let buckets = match self.cache.get(&window) {
            Some(buckets) => buckets,
            None => {
                computed = self.compute_buckets(window);
                &computed
            }
        };

        buckets
            .iter()
            .filter_map(|(&bucket, partial)| {
                let start = bucket * window;
                partial.finish(func).map(|value| WindowValue {
                    start,
                    end: start.saturating_add(window),
                    count: partial.count,
                    value,
                })
            })
            .collect()
    }

    /// Aggregate all live entries in `[start, end)`
    pub fn aggregate_range(&self, start: Timestamp, end: Timestamp, func: AggregateFn) -> Option<f64> {
        let mut partial = PartialAggregate::default();
        for (_, &value) in self.live_range(start, Bound::Excluded(end)) {
            partial.combine(&PartialAggregate::from_value(value));
        }
        partial.finish(func)
    }

    /// Live entries in display order
    pub fn samples(&self) -> Vec<Sample> {
        self.live_range(0, Bound::Unbounded)
            .map(|(key, &value)| Sample {
                timestamp: key.timestamp,
                replica: key.replica.clone(),
                value,
            })
            .collect()
    }

    /// Live entries with `start <= timestamp < end`, in display order
    pub fn range(&self, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        self.live_range(start, Bound::Excluded(end))
            .map(|(key, &value)| Sample {
                timestamp: key.timestamp,
                replica: key.replica.clone(),
                value,
            })
            .collect()
    }

    /// Most recent live entry
    pub fn latest(&self) -> Option<Sample> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| !self.tombstones.contains(*key))
            .map(|(key, &value)| Sample {
                timestamp: key.timestamp,
                replica: key.replica.clone(),
                value,
            })
    }

    pub fn len(&self) -> usize {
        self.entries
            .keys()
            .filter(|key| !self.tombstones.contains(*key))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_range(
        &self,
        start: Timestamp,
        end: Bound<Timestamp>,
    ) -> impl Iterator<Item = (&EntryKey, &f64)> {
        let lower = EntryKey {
            timestamp: start,
            replica: ReplicaId::new(),
            counter: 0,
        };
        self.entries
            .range(lower..)
            .take_while(move |(key, _)| match end {
                Bound::Excluded(end) => key.timestamp < end,
                Bound::Included(end) => key.timestamp <= end,
                Bound::Unbounded => true,
            })
            .filter(|(key, _)| !self.tombstones.contains(*key))
    }

    fn fold_into_cache(&mut self, key: &EntryKey, value: f64) {
        for (&window, buckets) in self.cache.iter_mut() {
            buckets
                .entry(key.timestamp / window)
                .or_default()
                .combine(&PartialAggregate::from_value(value));
        }
    }

    fn compute_buckets(&self, window: u64) -> BTreeMap<u64, PartialAggregate> {
        let mut buckets: BTreeMap<u64, PartialAggregate> = BTreeMap::new();
        for (key, &value) in self.live_range(0, Bound::Unbounded) {
            buckets
                .entry(key.timestamp / window)
                .or_default()
                .combine(&PartialAggregate::from_value(value));
        }
        buckets
    }

    fn build_window(&mut self, window: u64) {
        let buckets = self.compute_buckets(window);
        self.cache.insert(window, buckets);
    }

    fn rebuild_cache(&mut self) {
        self.cache.clear();
        let windows: Vec<u64> = self.windows.iter().copied().collect();
        for window in windows {
            self.build_window(window);
        }
    }

    /// Recompute every cached bucket containing one of `timestamps`
    fn recompute_buckets(&mut self, timestamps: impl Iterator<Item = Timestamp>) {
        let timestamps: BTreeSet<Timestamp> = timestamps.collect();
        let windows: Vec<u64> = self.cache.keys().copied().collect();

        for window in windows {
            let buckets: BTreeSet<u64> = timestamps.iter().map(|ts| ts / window).collect();
            for bucket in buckets {
                let start = bucket * window;
                let end = start.checked_add(window).map_or(Bound::Unbounded, Bound::Excluded);
                let mut partial = PartialAggregate::default();
                for (_, &value) in self.live_range(start, end) {
                    partial.combine(&PartialAggregate::from_value(value));
                }
                if let Some(cached) = self.cache.get_mut(&window) {
                    if partial.count == 0 {
                        cached.remove(&bucket);
                    } else {
                        cached.insert(bucket, partial);
                    }
                }
            }
        }
    }
}

impl Crdt for TimeSeriesCrdt {
    type Value = Vec<Sample>;

    fn merge(&mut self, other: &Self) {
        let fresh_tombstones: Vec<EntryKey> = other
            .tombstones
            .difference(&self.tombstones)
            .cloned()
            .collect();

        // Entries that were live here and are now removed by the other side
        let invalidated: Vec<Timestamp> = fresh_tombstones
            .iter()
            .filter(|key| self.entries.contains_key(*key))
            .map(|key| key.timestamp)
            .collect();

        for key in fresh_tombstones {
            self.tombstones.insert(key);
        }

        for (key, &value) in &other.entries {
            if self.entries.contains_key(key) {
                continue;
            }
            self.entries.insert(key.clone(), value);
            if !self.tombstones.contains(key) {
                self.fold_into_cache(key, value);
            }
        }

        self.context.merge(&other.context);

        if !invalidated.is_empty() {
            self.recompute_buckets(invalidated.into_iter());
        }

        let new_windows: Vec<u64> = other.windows.difference(&self.windows).copied().collect();
        for window in new_windows {
            self.windows.insert(window);
            self.build_window(window);
        }
    }

    fn value(&self) -> Vec<Sample> {
        self.samples()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let mut delta = TimeSeriesCrdt::new();
        for (key, &value) in &self.entries {
            if !since.entries.contains_key(key) {
                delta.entries.insert(key.clone(), value);
            }
        }
        delta.tombstones = self
            .tombstones
            .difference(&since.tombstones)
            .cloned()
            .collect();
        delta.windows = self.windows.difference(&since.windows).copied().collect();
        for (replica, &counter) in self.context.iter() {
            if counter > since.context.get(replica) {
                delta.context.update(replica, counter);
            }
        }

        if delta.entries.is_empty()
            && delta.tombstones.is_empty()
            && delta.windows.is_empty()
            && delta.context.is_empty()
        {
            None
        } else {
            Some(delta)
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen: BTreeMap<(&str, u64), Timestamp> = BTreeMap::new();
        for (key, value) in &self.entries {
            if value.is_nan() {
                return Err(SyncError::InvariantViolation(format!(
                    "NaN value at entry {}:{}",
                    key.replica, key.counter
                )));
            }
            if let Some(previous) = seen.insert((key.replica.as_str(), key.counter), key.timestamp) {
                return Err(SyncError::InvariantViolation(format!(
                    "tag {}:{} reused at timestamps {} and {}",
                    key.replica, key.counter, previous, key.timestamp
                )));
            }
            if !self.context.contains(&key.replica, key.counter) {
                return Err(SyncError::InvariantViolation(format!(
                    "tag {}:{} is ahead of the causal context",
                    key.replica, key.counter
                )));
            }
        }
        Ok(())
    }
}
