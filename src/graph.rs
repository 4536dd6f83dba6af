//! Dependency graph of resolved packages
//!
//! Nodes are package identities, edges are "imports" relations. Import cycles
//! are legitimate data, so nothing here assumes a DAG: traversals track
//! visited nodes and stop at a caller-provided bound.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Canonical identity of a package (its import path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(Arc<str>);

impl PackageId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PackageId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl Borrow<str> for PackageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Inconsistencies detected while updating the graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("package identity must not be empty")]
    EmptyIdentity,
}

#[derive(Default)]
struct Nodes {
    /// Outgoing edges per node, shared with live `Neighbors` iterators
    imports: HashMap<PackageId, Arc<Vec<PackageId>>>,
    edges: usize,
}

impl Nodes {
    fn intern(&mut self, id: &str) -> Result<PackageId, GraphError> {
        if id.is_empty() {
            return Err(GraphError::EmptyIdentity);
        }
        if let Some((existing, _)) = self.imports.get_key_value(id) {
            return Ok(existing.clone());
        }
        let node = PackageId::new(id);
        self.imports.insert(node.clone(), Arc::default());
        Ok(node)
    }
}

/// Thread-safe package dependency graph
///
/// All mutations go through one mutex. Critical sections are short and never
/// span an await point.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: Mutex<Nodes>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package node, returning the canonical identity
    ///
    /// Adding an existing package is a no-op.
    pub fn add_package(&self, id: &str) -> Result<PackageId, GraphError> {
        self.nodes.lock().intern(id)
    }

    /// Record that `from` imports `to`, creating either node as needed
    ///
    /// Returns `true` if the edge was not present before.
    pub fn add_dependency(&self, from: &str, to: &str) -> Result<bool, GraphError> {
        if from.is_empty() || to.is_empty() {
            return Err(GraphError::EmptyIdentity);
        }
        let mut nodes = self.nodes.lock();
        let from = nodes.intern(from)?;
        let to = nodes.intern(to)?;

        let imports = nodes.imports.entry(from).or_default();
        if imports.contains(&to) {
            return Ok(false);
        }
        // Copy-on-write: iterators created earlier keep their snapshot
        Arc::make_mut(imports).push(to);
        nodes.edges += 1;
        Ok(true)
    }

    /// Direct dependencies of `id`, in insertion order
    ///
    /// Unknown packages simply have no known dependencies yet.
    pub fn neighbors(&self, id: &str) -> Neighbors {
        let imports = self
            .nodes
            .lock()
            .imports
            .get(id)
            .map(Arc::clone)
            .unwrap_or_default();
        Neighbors { imports, next: 0 }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.lock().imports.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().imports.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.lock().edges
    }

    /// Packages that directly import `id`, sorted
    pub fn dependents(&self, id: &str) -> Vec<PackageId> {
        let nodes = self.nodes.lock();
        let mut dependents: Vec<PackageId> = nodes
            .imports
            .iter()
            .filter(|(_, imports)| imports.iter().any(|dep| dep.as_str() == id))
            .map(|(node, _)| node.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Breadth-first walk of everything reachable from `root`
    ///
    /// `root` itself is excluded unless a cycle leads back to it. At most
    /// `limit` packages are returned; each is reported once.
    pub fn transitive_dependencies(&self, root: &str, limit: usize) -> Vec<PackageId> {
        let mut visited: HashSet<PackageId> = HashSet::new();
        let mut found = Vec::new();
        let mut queue: VecDeque<PackageId> = self.neighbors(root).collect();

        while let Some(next) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            if !visited.insert(next.clone()) {
                continue;
            }
            queue.extend(
                self.neighbors(next.as_str())
                    .filter(|dep| !visited.contains(dep)),
            );
            found.push(next);
        }

        found
    }
}

/// Lazy iterator over one node's direct dependencies
///
/// Holds a snapshot of the edge list, not the graph lock.
pub struct Neighbors {
    imports: Arc<Vec<PackageId>>,
    next: usize,
}

impl Iterator for Neighbors {
    type Item = PackageId;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.imports.get(self.next).cloned();
        if item.is_some() {
            self.next += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.imports.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Neighbors {}
