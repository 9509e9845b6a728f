//! Type hierarchy oracle
//!
//! Frame computation needs the nearest common superclass of two classes.
//! Asking the host would load those classes, and loading goes through this
//! loader, so the oracle answers from class headers alone. Headers come from
//! a [`HeaderSource`] that reads the raw artifact without decoding,
//! transforming or defining it.
//!
//! Nodes are cached forever: a class observed once never changes its
//! supertypes.

use anvil_bytecode::{ClassHeader, ResolveError, SuperClassResolver, OBJECT_CLASS};
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use thiserror::Error;

/// Supertype information for one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyNode {
    /// Class name
    pub name: String,
    /// Direct superclass
    pub super_name: Option<String>,
    /// Directly implemented interfaces
    pub interfaces: Vec<String>,
    /// Whether the class is an interface
    pub is_interface: bool,
}

impl HierarchyNode {
    /// Create a class node
    pub fn class(name: impl Into<String>, super_name: Option<&str>) -> Self {
        Self {
            name: name.into(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            is_interface: false,
        }
    }

    /// Create an interface node
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            is_interface: true,
            ..Self::class(name, None)
        }
    }

    /// Add implemented interfaces
    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.extend(interfaces.into_iter().map(Into::into));
        self
    }
}

impl From<ClassHeader> for HierarchyNode {
    fn from(header: ClassHeader) -> Self {
        let is_interface = header.is_interface();
        Self {
            name: header.name,
            super_name: header.super_name,
            interfaces: header.interfaces,
            is_interface,
        }
    }
}

/// Structural errors in the type hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    /// A supertype chain or interface graph loops back on itself
    #[error("Cyclic type hierarchy through {0}")]
    Cycle(String),

    /// A class has no superclass and is not the universal base
    #[error("{0} does not lead to the universal base type")]
    MissingBase(String),

    /// No header is available for a class
    #[error("Class {0} not found")]
    NotFound(String),

    /// A header could not be read
    #[error("Failed to read header of {name}: {message}")]
    Header {
        /// Class name
        name: String,
        /// Reader failure
        message: String,
    },
}

/// Supplies minimal class headers
pub trait HeaderSource: Send + Sync {
    /// Header of `name`, or `None` when the class does not exist
    fn read_header(&self, name: &str) -> Result<Option<HierarchyNode>, HierarchyError>;
}

impl<F> HeaderSource for F
where
    F: Fn(&str) -> Result<Option<HierarchyNode>, HierarchyError> + Send + Sync,
{
    fn read_header(&self, name: &str) -> Result<Option<HierarchyNode>, HierarchyError> {
        self(name)
    }
}

/// Memoized partial view of the type hierarchy
pub struct HierarchyOracle {
    base: String,
    source: Arc<dyn HeaderSource>,
    nodes: DashMap<String, Arc<HierarchyNode>>,
    common: DashMap<(String, String), String>,
}

impl HierarchyOracle {
    /// Create an oracle rooted at `lang.Object`
    pub fn new(source: Arc<dyn HeaderSource>) -> Self {
        Self::with_base(OBJECT_CLASS, source)
    }

    /// Create an oracle with a custom universal base type
    pub fn with_base(base: impl Into<String>, source: Arc<dyn HeaderSource>) -> Self {
        let base = base.into();
        let nodes = DashMap::new();
        nodes.insert(base.clone(), Arc::new(HierarchyNode::class(base.clone(), None)));
        Self {
            base,
            source,
            nodes,
            common: DashMap::new(),
        }
    }

    /// Universal base type
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Number of cached nodes
    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Node for `name`, reading its header on first use
    pub fn get(&self, name: &str) -> Result<Arc<HierarchyNode>, HierarchyError> {
        if let Some(node) = self.nodes.get(name).map(|n| Arc::clone(n.value())) {
            return Ok(node);
        }
        let node = self
            .source
            .read_header(name)?
            .ok_or_else(|| HierarchyError::NotFound(name.to_string()))?;
        let entry = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(node));
        Ok(Arc::clone(entry.value()))
    }

    /// Nearest common ancestor of two classes
    ///
    /// Symmetric and reflexive; the universal base absorbs everything. When
    /// either side is an interface and neither is assignable to the other,
    /// the answer is the universal base.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Result<String, HierarchyError> {
        if a == b {
            return Ok(a.to_string());
        }
        if a == self.base || b == self.base {
            return Ok(self.base.clone());
        }

        let key = if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        if let Some(answer) = self.common.get(&key).map(|v| v.value().clone()) {
            return Ok(answer);
        }

        let answer = self.compute_common(&key.0, &key.1)?;
        self.common.insert(key, answer.clone());
        Ok(answer)
    }

    fn compute_common(&self, a: &str, b: &str) -> Result<String, HierarchyError> {
        let other = self.get(b)?;
        let mut current = self.get(a)?;
        let mut visited = FxHashSet::default();

        loop {
            if current.name == self.base {
                return Ok(self.base.clone());
            }
            if !visited.insert(current.name.clone()) {
                return Err(HierarchyError::Cycle(current.name.clone()));
            }
            if self.is_assignable(&other, &current)? {
                return Ok(current.name.clone());
            }
            if self.is_assignable(&current, &other)? {
                return Ok(other.name.clone());
            }
            if current.is_interface || other.is_interface {
                return Ok(self.base.clone());
            }
            current = self.superclass(&current)?;
        }
    }

    fn superclass(&self, node: &HierarchyNode) -> Result<Arc<HierarchyNode>, HierarchyError> {
        match &node.super_name {
            Some(name) => self.get(name),
            None if node.is_interface => self.get(&self.base),
            None => Err(HierarchyError::MissingBase(node.name.clone())),
        }
    }

    /// Whether a value of type `sub` can be stored where `sup` is expected
    fn is_assignable(&self, sub: &Arc<HierarchyNode>, sup: &HierarchyNode) -> Result<bool, HierarchyError> {
        if sub.name == sup.name || sup.name == self.base {
            return Ok(true);
        }
        if sup.is_interface {
            let mut path = FxHashSet::default();
            let mut done = FxHashSet::default();
            return self.implements(sub, &sup.name, &mut path, &mut done);
        }

        let mut visited = FxHashSet::default();
        let mut current = Arc::clone(sub);
        loop {
            if current.name == sup.name {
                return Ok(true);
            }
            if current.name == self.base {
                return Ok(false);
            }
            if !visited.insert(current.name.clone()) {
                return Err(HierarchyError::Cycle(current.name.clone()));
            }
            current = match &current.super_name {
                Some(name) => self.get(name)?,
                None => return Ok(false),
            };
        }
    }

    /// Depth-first search of the interfaces `node` implements, including
    /// through its superclasses
    fn implements(
        &self,
        node: &HierarchyNode,
        interface: &str,
        path: &mut FxHashSet<String>,
        done: &mut FxHashSet<String>,
    ) -> Result<bool, HierarchyError> {
        if node.name == self.base || done.contains(&node.name) {
            return Ok(false);
        }
        if !path.insert(node.name.clone()) {
            return Err(HierarchyError::Cycle(node.name.clone()));
        }

        for name in &node.interfaces {
            if name == interface {
                return Ok(true);
            }
            let parent = self.get(name)?;
            if self.implements(&parent, interface, path, done)? {
                return Ok(true);
            }
        }
        if let Some(name) = &node.super_name {
            let parent = self.get(name)?;
            if self.implements(&parent, interface, path, done)? {
                return Ok(true);
            }
        }

        path.remove(&node.name);
        done.insert(node.name.clone());
        Ok(false)
    }
}

impl SuperClassResolver for HierarchyOracle {
    fn common_super_class(&self, a: &str, b: &str) -> Result<String, ResolveError> {
        self.common_ancestor(a, b).map_err(|e| Box::new(e) as ResolveError)
    }
}

impl std::fmt::Debug for HierarchyOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyOracle")
            .field("base", &self.base)
            .field("nodes", &self.nodes.len())
            .field("pairs", &self.common.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn oracle(nodes: Vec<HierarchyNode>) -> (HierarchyOracle, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        let table: FxHashMap<String, HierarchyNode> =
            nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        let source = move |name: &str| -> Result<Option<HierarchyNode>, HierarchyError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(table.get(name).cloned())
        };
        (HierarchyOracle::new(Arc::new(source)), reads)
    }

    fn scenario() -> Vec<HierarchyNode> {
        vec![
            HierarchyNode::class("game.A", Some(OBJECT_CLASS)),
            HierarchyNode::class("game.B", Some("game.A")),
            HierarchyNode::class("game.C", Some("game.A")),
            HierarchyNode::class("game.D", Some(OBJECT_CLASS)).with_interfaces(["game.I"]),
            HierarchyNode::class("game.E", Some("game.D")),
            HierarchyNode::interface("game.I"),
        ]
    }

    #[test]
    fn test_siblings_meet_at_parent() {
        let (oracle, _) = oracle(scenario());
        assert_eq!(oracle.common_ancestor("game.B", "game.C").unwrap(), "game.A");
        assert_eq!(oracle.common_ancestor("game.B", "game.D").unwrap(), OBJECT_CLASS);
    }

    #[test]
    fn test_subclass_and_superclass() {
        let (oracle, _) = oracle(scenario());
        assert_eq!(oracle.common_ancestor("game.B", "game.A").unwrap(), "game.A");
        assert_eq!(oracle.common_ancestor("game.A", "game.B").unwrap(), "game.A");
    }

    #[test]
    fn test_interface_through_superclass() {
        let (oracle, _) = oracle(scenario());
        assert_eq!(oracle.common_ancestor("game.E", "game.I").unwrap(), "game.I");
        assert_eq!(oracle.common_ancestor("game.I", "game.E").unwrap(), "game.I");
        assert_eq!(oracle.common_ancestor("game.I", "game.B").unwrap(), OBJECT_CLASS);
    }

    #[test]
    fn test_reflexive_and_base() {
        let (oracle, reads) = oracle(scenario());
        assert_eq!(oracle.common_ancestor("game.B", "game.B").unwrap(), "game.B");
        assert_eq!(oracle.common_ancestor("game.B", OBJECT_CLASS).unwrap(), OBJECT_CLASS);
        assert_eq!(oracle.common_ancestor(OBJECT_CLASS, "game.Missing").unwrap(), OBJECT_CLASS);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nodes_and_pairs_are_memoized() {
        let (oracle, reads) = oracle(scenario());
        oracle.common_ancestor("game.B", "game.C").unwrap();
        let after_first = reads.load(Ordering::SeqCst);
        oracle.common_ancestor("game.C", "game.B").unwrap();
        oracle.get("game.A").unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn test_base_is_preseeded() {
        let (oracle, reads) = oracle(Vec::new());
        let base = oracle.get(OBJECT_CLASS).unwrap();
        assert_eq!(base.super_name, None);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_is_reported() {
        let (oracle, _) = oracle(vec![
            HierarchyNode::class("game.X", Some("game.Y")),
            HierarchyNode::class("game.Y", Some("game.X")),
            HierarchyNode::class("game.Z", Some(OBJECT_CLASS)),
        ]);
        let err = oracle.common_ancestor("game.X", "game.Z").unwrap_err();
        assert!(matches!(err, HierarchyError::Cycle(_)));
    }

    #[test]
    fn test_interface_cycle_is_reported() {
        let (oracle, _) = oracle(vec![
            HierarchyNode::interface("game.I").with_interfaces(["game.J"]),
            HierarchyNode::interface("game.J").with_interfaces(["game.I"]),
            HierarchyNode::interface("game.K"),
            HierarchyNode::class("game.C", Some(OBJECT_CLASS)).with_interfaces(["game.I"]),
        ]);
        let err = oracle.common_ancestor("game.C", "game.K").unwrap_err();
        assert!(matches!(err, HierarchyError::Cycle(_)));
    }

    #[test]
    fn test_missing_base() {
        let (oracle, _) = oracle(vec![
            HierarchyNode::class("game.Orphan", None),
            HierarchyNode::class("game.Other", Some(OBJECT_CLASS)),
        ]);
        let err = oracle.common_ancestor("game.Orphan", "game.Other").unwrap_err();
        assert_eq!(err, HierarchyError::MissingBase("game.Orphan".to_string()));
    }

    #[test]
    fn test_unknown_class() {
        let (oracle, _) = oracle(scenario());
        let err = oracle.common_ancestor("game.B", "game.Nope").unwrap_err();
        assert_eq!(err, HierarchyError::NotFound("game.Nope".to_string()));
    }

    #[test]
    fn test_resolver_surface() {
        let (oracle, _) = oracle(scenario());
        let resolver: &dyn SuperClassResolver = &oracle;
        assert_eq!(resolver.common_super_class("game.C", "game.B").unwrap(), "game.A");
        let err = resolver.common_super_class("game.B", "game.Nope").unwrap_err();
        assert!(err.downcast_ref::<HierarchyError>().is_some());
    }
}
