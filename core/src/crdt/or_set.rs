//! OR-Set: Observed-Remove Set CRDT
//!
//! Every add is tagged with a unique `(replica, counter)` tag. A remove
//! tombstones only the tags it has observed, so an add that is concurrent
//! with a remove (a tag the remover never saw) survives the merge.
//!
//! # Properties
//!
//! - **Add-wins on concurrency:** unobserved tags are never tombstoned
//! - **Monotonic state:** add-tags and tombstones only grow
//! - **No tag reuse:** counters come from a per-replica causal context
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{Crdt, OrSet};
//!
//! let mut node1 = OrSet::new();
//! node1.add("x".to_string(), "node1");
//!
//! let mut node2 = node1.clone();
//! node2.add("x".to_string(), "node2"); // new tag, concurrent with the remove below
//!
//! node1.remove(&"x".to_string()); // observes only node1's tag
//! node1.merge(&node2);
//! assert!(node1.contains(&"x".to_string()));
//! ```

use super::{Crdt, Element, Tag};
use crate::error::{Result, SyncError};
use crate::sync::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Observed-remove set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Element"))]
pub struct OrSet<T: Element> {
    /// Every add-tag ever observed, per element
    #[serde(with = "super::pairs")]
    entries: BTreeMap<T, BTreeSet<Tag>>,

    /// Tags that have been removed
    tombstones: BTreeSet<Tag>,

    /// Highest tag counter observed per replica
    context: VectorClock,
}

impl<T: Element> Default for OrSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> OrSet<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            context: VectorClock::new(),
        }
    }

    /// Add an element under a fresh tag
    ///
    /// Returns the delta carrying the new tag.
    pub fn add(&mut self, element: T, replica: &str) -> OrSet<T> {
        let counter = self.context.tick(replica);
        let tag = Tag::new(replica, counter);

        self.entries
            .entry(element.clone())
            .or_default()
            .insert(tag.clone());

        let mut delta = OrSet::new();
        delta.entries.entry(element).or_default().insert(tag);
        delta.context.update(replica, counter);
        delta
    }

    /// Remove an element by tombstoning every tag observed for it
    ///
    /// Returns `None` if the element is not currently a member.
    pub fn remove(&mut self, element: &T) -> Option<OrSet<T>> {
        let observed = self.live_tags(element);
        if observed.is_empty() {
            return None;
        }

        let mut delta = OrSet::new();
        for tag in observed {
            self.tombstones.insert(tag.clone());
            delta.tombstones.insert(tag);
        }
        Some(delta)
    }

    /// Whether the element has at least one non-tombstoned tag
    pub fn contains(&self, element: &T) -> bool {
        self.entries
            .get(element)
            .map(|tags| tags.iter().any(|tag| !self.tombstones.contains(tag)))
            .unwrap_or(false)
    }

    /// Tags of an element that have not been removed
    pub fn live_tags(&self, element: &T) -> BTreeSet<Tag> {
        self.entries
            .get(element)
            .map(|tags| {
                tags.iter()
                    .filter(|tag| !self.tombstones.contains(tag))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All add-tags ever observed (live and removed)
    pub fn add_tag_count(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Iterate over current members in element order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter(|(_, tags)| tags.iter().any(|tag| !self.tombstones.contains(tag)))
            .map(|(element, _)| element)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Causal context: highest counter observed per replica
    pub fn context(&self) -> &VectorClock {
        &self.context
    }
}

impl<T: Element> Crdt for OrSet<T> {
    type Value = BTreeSet<T>;

    fn merge(&mut self, other: &Self) {
        for (element, tags) in &other.entries {
            let local = self.entries.entry(element.clone()).or_default();
            for tag in tags {
                if !local.contains(tag) {
                    local.insert(tag.clone());
                }
            }
        }
        for tag in &other.tombstones {
            if !self.tombstones.contains(tag) {
                self.tombstones.insert(tag.clone());
            }
        }
        self.context.merge(&other.context);
    }

    fn value(&self) -> BTreeSet<T> {
        self.iter().cloned().collect()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let mut delta = OrSet::new();

        for (element, tags) in &self.entries {
            let known = since.entries.get(element);
            let fresh: BTreeSet<Tag> = tags
                .iter()
                .filter(|tag| known.map(|k| !k.contains(*tag)).unwrap_or(true))
                .cloned()
                .collect();
            if !fresh.is_empty() {
                delta.entries.insert(element.clone(), fresh);
            }
        }

        delta.tombstones = self
            .tombstones
            .difference(&since.tombstones)
            .cloned()
            .collect();

        for (replica, &counter) in self.context.iter() {
            if counter > since.context.get(replica) {
                delta.context.update(replica, counter);
            }
        }

        if delta.entries.is_empty() && delta.tombstones.is_empty() && delta.context.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    fn validate(&self) -> Result<()> {
        let mut owners: BTreeMap<&Tag, &T> = BTreeMap::new();
        for (element, tags) in &self.entries {
            for tag in tags {
                if let Some(previous) = owners.insert(tag, element) {
                    return Err(SyncError::InvariantViolation(format!(
                        "tag {} reused for {:?} and {:?}",
                        tag, previous, element
                    )));
                }
                if !self.context.contains(&tag.replica, tag.counter) {
                    return Err(SyncError::InvariantViolation(format!(
                        "tag {} is ahead of the causal context",
                        tag
                    )));
                }
            }
        }
        Ok(())
    }
}
