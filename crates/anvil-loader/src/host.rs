//! The runtime classes are defined into

use crate::hierarchy::HierarchyNode;
use std::sync::Arc;
use thiserror::Error;

/// A defined or bootstrap class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassHandle {
    /// Host-assigned id
    pub id: usize,
    /// Class name
    pub name: Arc<str>,
}

impl ClassHandle {
    /// Create a handle
    pub fn new(id: usize, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }
}

/// The host refused a class definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefineError {
    /// The bytes are not a class file
    #[error("Malformed class: {0}")]
    Malformed(String),

    /// The class failed structural verification
    #[error("Verification failed: {0}")]
    Verify(String),

    /// The bytes define a different class than requested
    #[error("Class name mismatch: requested {requested}, found {found}")]
    NameMismatch {
        /// Requested name
        requested: String,
        /// Name in the bytes
        found: String,
    },

    /// The class is already defined
    #[error("Duplicate class definition: {0}")]
    Duplicate(String),
}

/// Runtime that owns class definitions
///
/// Classes come from two tiers: the bootstrap tier the host resolves on its
/// own, and classes the loader defines after transformation.
pub trait ClassHost: Send + Sync {
    /// Define a class from its final bytes
    fn define_class(&self, name: &str, bytes: &[u8]) -> Result<ClassHandle, DefineError>;

    /// Resolve a class through the bootstrap tier
    fn resolve_bootstrap(&self, name: &str) -> Option<ClassHandle>;

    /// Supertype information of a bootstrap class
    fn bootstrap_hierarchy(&self, name: &str) -> Option<HierarchyNode>;
}
