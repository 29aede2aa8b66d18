//! G-Set: Grow-only Set CRDT
//!
//! Elements can be added but never removed. Merge is set union.

use super::{Crdt, Element};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Grow-only set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Element"))]
pub struct GSet<T: Element> {
    elements: BTreeSet<T>,
}

impl<T: Element> Default for GSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> GSet<T> {
    pub fn new() -> Self {
        Self {
            elements: BTreeSet::new(),
        }
    }

    /// Insert an element, returning the single-element delta
    pub fn insert(&mut self, element: T) -> GSet<T> {
        self.elements.insert(element.clone());
        let mut delta = GSet::new();
        delta.elements.insert(element);
        delta
    }

    pub fn contains(&self, element: &T) -> bool {
        self.elements.contains(element)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate in element order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.iter()
    }
}

impl<T: Element> Crdt for GSet<T> {
    type Value = BTreeSet<T>;

    fn merge(&mut self, other: &Self) {
        for element in &other.elements {
            if !self.elements.contains(element) {
                self.elements.insert(element.clone());
            }
        }
    }

    fn value(&self) -> BTreeSet<T> {
        self.elements.clone()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let elements: BTreeSet<T> = self.elements.difference(&since.elements).cloned().collect();
        if elements.is_empty() {
            None
        } else {
            Some(GSet { elements })
        }
    }
}

impl<T: Element> FromIterator<T> for GSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = GSet::new();
        set.insert("a".to_string());
        assert!(set.contains(&"a".to_string()));
        assert!(!set.contains(&"b".to_string()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_merge_is_union() {
        let mut a: GSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        let b: GSet<String> = ["y", "z"].iter().map(|s| s.to_string()).collect();

        a.merge(&b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_to_delta_is_difference() {
        let since: GSet<String> = ["x"].iter().map(|s| s.to_string()).collect();
        let mut current = since.clone();
        current.insert("y".to_string());

        let delta = current.to_delta(&since).unwrap();
        assert_eq!(delta.len(), 1);
        assert!(delta.contains(&"y".to_string()));
    }
}
