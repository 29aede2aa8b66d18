//! GraphCRDT: directed graph built from two OR-Sets and LWW edge attributes
//!
//! - `vertices`: OR-Set of vertex IDs
//! - `edges`: OR-Set of `(from, to)` pairs
//! - `edge_data`: per-edge attribute registers (last writer wins)
//!
//! An edge is *valid* only while both endpoints are live vertices. Validity
//! is computed at read time, so removing a vertex never has to touch the edge
//! set; stale edges are simply filtered out of every query.

use super::{Crdt, LwwRegister, OrSet};
use crate::error::{Result, SyncError};
use crate::sync::TimestampSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Vertex identifier
pub type VertexId = String;

/// Directed edge key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: VertexId,
    pub to: VertexId,
}

impl EdgeKey {
    pub fn new(from: impl Into<VertexId>, to: impl Into<VertexId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

type Attributes = BTreeMap<String, LwwRegister<serde_json::Value>>;

/// Read-only projection of the valid graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub vertices: BTreeSet<VertexId>,
    pub edges: Vec<EdgeKey>,
}

/// Replicated directed graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphCrdt {
    vertices: OrSet<VertexId>,
    edges: OrSet<EdgeKey>,
    #[serde(with = "super::pairs")]
    edge_data: BTreeMap<EdgeKey, Attributes>,
}

impl GraphCrdt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: impl Into<VertexId>, replica: &str) -> GraphCrdt {
        GraphCrdt {
            vertices: self.vertices.add(vertex.into(), replica),
            ..GraphCrdt::default()
        }
    }

    /// Remove a vertex; its edges stay in the edge set but become invalid
    pub fn remove_vertex(&mut self, vertex: &str) -> Option<GraphCrdt> {
        self.vertices
            .remove(&vertex.to_string())
            .map(|vertices| GraphCrdt {
                vertices,
                ..GraphCrdt::default()
            })
    }

    /// Add a directed edge between two live vertices
    pub fn add_edge(&mut self, from: &str, to: &str, replica: &str) -> Result<GraphCrdt> {
        for endpoint in [from, to] {
            if !self.has_vertex(endpoint) {
                return Err(SyncError::InvalidOperation(format!(
                    "cannot add edge {}->{}: vertex '{}' does not exist",
                    from, to, endpoint
                )));
            }
        }
        Ok(GraphCrdt {
            edges: self.edges.add(EdgeKey::new(from, to), replica),
            ..GraphCrdt::default()
        })
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> Option<GraphCrdt> {
        self.edges
            .remove(&EdgeKey::new(from, to))
            .map(|edges| GraphCrdt {
                edges,
                ..GraphCrdt::default()
            })
    }

    /// Write an edge attribute, stamped by `clock`
    pub fn set_edge_attribute(
        &mut self,
        from: &str,
        to: &str,
        key: impl Into<String>,
        value: serde_json::Value,
        clock: &mut impl TimestampSource,
        replica: &str,
    ) -> Result<GraphCrdt> {
        let edge = EdgeKey::new(from, to);
        if !self.edges.contains(&edge) {
            return Err(SyncError::InvalidOperation(format!(
                "cannot set attribute on missing edge {}",
                edge
            )));
        }

        let key = key.into();
        let written = self
            .edge_data
            .entry(edge.clone())
            .or_default()
            .entry(key.clone())
            .or_default()
            .assign(value, clock, replica);

        let mut delta = GraphCrdt::default();
        delta
            .edge_data
            .entry(edge)
            .or_default()
            .insert(key, written);
        Ok(delta)
    }

    pub fn has_vertex(&self, vertex: &str) -> bool {
        self.vertices.contains(&vertex.to_string())
    }

    /// Whether the edge is present and both endpoints are live
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.has_vertex(from) && self.has_vertex(to) && self.edges.contains(&EdgeKey::new(from, to))
    }

    pub fn vertices(&self) -> BTreeSet<VertexId> {
        self.vertices.value()
    }

    /// Edges whose endpoints are both live
    pub fn valid_edges(&self) -> Vec<EdgeKey> {
        self.edges
            .iter()
            .filter(|edge| self.has_vertex(&edge.from) && self.has_vertex(&edge.to))
            .cloned()
            .collect()
    }

    /// Edges still in the edge set whose endpoints are gone
    pub fn dangling_edges(&self) -> Vec<EdgeKey> {
        self.edges
            .iter()
            .filter(|edge| !self.has_vertex(&edge.from) || !self.has_vertex(&edge.to))
            .cloned()
            .collect()
    }

    /// Targets of valid outgoing edges, in vertex order
    pub fn neighbors(&self, vertex: &str) -> Vec<VertexId> {
        if !self.has_vertex(vertex) {
            return Vec::new();
        }
        self.edges
            .iter()
            .filter(|edge| edge.from == vertex && self.has_vertex(&edge.to))
            .map(|edge| edge.to.clone())
            .collect()
    }

    /// Current attribute values of an edge
    pub fn edge_attributes(&self, from: &str, to: &str) -> BTreeMap<String, serde_json::Value> {
        self.edge_data
            .get(&EdgeKey::new(from, to))
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(key, register)| (key.clone(), register.value()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Shortest path (fewest edges) from `start` to `end`
    ///
    /// Breadth-first search over valid edges. `visited` tracking and the
    /// `max_depth` bound (maximum number of edges) guarantee termination on
    /// cyclic graphs. Returns `None` when no path exists within the bound.
    ///
    /// # Example
    ///
    /// ```
    /// use meshkit_core::crdt::GraphCrdt;
    ///
    /// let mut graph = GraphCrdt::new();
    /// for v in ["a", "b", "c"] {
    ///     graph.add_vertex(v, "n1");
    /// }
    /// graph.add_edge("a", "b", "n1").unwrap();
    /// graph.add_edge("b", "c", "n1").unwrap();
    /// graph.add_edge("c", "a", "n1").unwrap();
    ///
    /// assert_eq!(graph.get_path("a", "c", 2).unwrap(), vec!["a", "b", "c"]);
    /// assert!(graph.get_path("a", "c", 1).is_none());
    /// ```
    pub fn get_path(&self, start: &str, end: &str, max_depth: usize) -> Option<Vec<VertexId>> {
        if !self.has_vertex(start) || !self.has_vertex(end) {
            return None;
        }
        if start == end {
            return Some(vec![start.to_string()]);
        }

        let adjacency = self.adjacency();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();

        visited.insert(start);
        queue.push_back((start, 0));

        while let Some((vertex, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(targets) = adjacency.get(vertex) else {
                continue;
            };
            for &next in targets {
                if !visited.insert(next) {
                    continue;
                }
                parents.insert(next, vertex);
                if next == end {
                    return Some(Self::reconstruct(&parents, start, end));
                }
                queue.push_back((next, depth + 1));
            }
        }

        None
    }

    fn adjacency(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in self.edges.iter() {
            if self.has_vertex(&edge.from) && self.has_vertex(&edge.to) {
                adjacency
                    .entry(edge.from.as_str())
                    .or_default()
                    .push(edge.to.as_str());
            }
        }
        adjacency
    }

    fn reconstruct(parents: &BTreeMap<&str, &str>, start: &str, end: &str) -> Vec<VertexId> {
        let mut path = vec![end.to_string()];
        let mut current = end;
        while current != start {
            match parents.get(current) {
                Some(&parent) => {
                    path.push(parent.to_string());
                    current = parent;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }
}

impl Crdt for GraphCrdt {
    type Value = GraphSnapshot;

    /// Vertices, edges and attributes merge as independent steps; callers
    /// must hold the instance write lock so readers never see a half merge.
    fn merge(&mut self, other: &Self) {
        self.vertices.merge(&other.vertices);
        self.edges.merge(&other.edges);
        for (edge, attrs) in &other.edge_data {
            let local = self.edge_data.entry(edge.clone()).or_default();
            for (key, register) in attrs {
                local.entry(key.clone()).or_default().merge(register);
            }
        }
    }

    fn value(&self) -> GraphSnapshot {
        GraphSnapshot {
            vertices: self.vertices(),
            edges: self.valid_edges(),
        }
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let vertices = self.vertices.to_delta(&since.vertices);
        let edges = self.edges.to_delta(&since.edges);

        let mut edge_data: BTreeMap<EdgeKey, Attributes> = BTreeMap::new();
        for (edge, attrs) in &self.edge_data {
            for (key, register) in attrs {
                let known = since
                    .edge_data
                    .get(edge)
                    .and_then(|a| a.get(key))
                    .cloned()
                    .unwrap_or_default();
                if let Some(newer) = register.to_delta(&known) {
                    edge_data.entry(edge.clone()).or_default().insert(key.clone(), newer);
                }
            }
        }

        if vertices.is_none() && edges.is_none() && edge_data.is_empty() {
            return None;
        }
        Some(GraphCrdt {
            vertices: vertices.unwrap_or_default(),
            edges: edges.unwrap_or_default(),
            edge_data,
        })
    }

    fn validate(&self) -> Result<()> {
        self.vertices.validate()?;
        self.edges.validate()
    }
}
