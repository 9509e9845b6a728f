//! Language adapters
//!
//! Mods name their transformations and entrypoints with specifier strings.
//! A [`LanguageAdapter`] turns a specifier into a live instance with the
//! requested [`Capability`]. The loader only ever inspects that capability
//! surface, so a mod can be written in anything an adapter exists for.

use crate::context::LoaderPlugin;
use crate::pipeline::Transformation;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

/// Capability an entrypoint is expected to provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// A class transformation
    Transformation,
    /// A hook run once the loader is set up
    LoaderPlugin,
}

/// An instantiated entrypoint
#[derive(Clone)]
pub enum Instance {
    /// A class transformation
    Transformation(Arc<dyn Transformation>),
    /// A loader plugin
    LoaderPlugin(Arc<dyn LoaderPlugin>),
}

impl Instance {
    /// Capability the instance provides
    pub fn capability(&self) -> Capability {
        match self {
            Instance::Transformation(_) => Capability::Transformation,
            Instance::LoaderPlugin(_) => Capability::LoaderPlugin,
        }
    }

    /// The transformation, if this is one
    pub fn into_transformation(self) -> Option<Arc<dyn Transformation>> {
        match self {
            Instance::Transformation(t) => Some(t),
            Instance::LoaderPlugin(_) => None,
        }
    }

    /// The loader plugin, if this is one
    pub fn into_loader_plugin(self) -> Option<Arc<dyn LoaderPlugin>> {
        match self {
            Instance::LoaderPlugin(p) => Some(p),
            Instance::Transformation(_) => None,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Instance({:?})", self.capability())
    }
}

/// Errors creating instances
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Nothing is registered under the specifier
    #[error("Could not locate entrypoint specified by {0}")]
    NotFound(String),

    /// The specifier resolved to an instance with another capability
    #[error("{specifier} provides {found:?}, expected {expected:?}")]
    CapabilityMismatch {
        /// Requested specifier
        specifier: String,
        /// Requested capability
        expected: Capability,
        /// Capability of the resolved instance
        found: Capability,
    },

    /// The specifier is malformed
    #[error("Invalid specifier {0:?}: expected `path` or `path::member`")]
    InvalidSpecifier(String),
}

/// Creates instances from specifiers
pub trait LanguageAdapter: Send + Sync {
    /// Instantiate `specifier` with the given capability
    fn create_instance(
        &self,
        specifier: &str,
        capability: Capability,
    ) -> Result<Instance, AdapterError>;
}

type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

/// Adapter for entrypoints compiled into the host process
///
/// Factories are registered under `path` or `path::member` specifiers.
#[derive(Default)]
pub struct NativeAdapter {
    factories: RwLock<FxHashMap<String, Factory>>,
}

impl NativeAdapter {
    /// Create an adapter with no factories
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a specifier
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::InvalidSpecifier`] when the specifier is
    /// malformed.
    pub fn register<F>(&self, specifier: &str, factory: F) -> Result<(), AdapterError>
    where
        F: Fn() -> Instance + Send + Sync + 'static,
    {
        validate_specifier(specifier)?;
        self.factories
            .write()
            .insert(specifier.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register a shared transformation instance
    pub fn register_transformation<T>(&self, specifier: &str, transformation: T) -> Result<(), AdapterError>
    where
        T: Transformation + 'static,
    {
        let shared: Arc<dyn Transformation> = Arc::new(transformation);
        self.register(specifier, move || Instance::Transformation(Arc::clone(&shared)))
    }

    /// Register a shared loader plugin instance
    pub fn register_loader_plugin<P>(&self, specifier: &str, plugin: P) -> Result<(), AdapterError>
    where
        P: LoaderPlugin + 'static,
    {
        let shared: Arc<dyn LoaderPlugin> = Arc::new(plugin);
        self.register(specifier, move || Instance::LoaderPlugin(Arc::clone(&shared)))
    }
}

impl LanguageAdapter for NativeAdapter {
    fn create_instance(
        &self,
        specifier: &str,
        capability: Capability,
    ) -> Result<Instance, AdapterError> {
        validate_specifier(specifier)?;
        let factory = self
            .factories
            .read()
            .get(specifier)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(specifier.to_string()))?;

        let instance = factory();
        if instance.capability() != capability {
            return Err(AdapterError::CapabilityMismatch {
                specifier: specifier.to_string(),
                expected: capability,
                found: instance.capability(),
            });
        }
        Ok(instance)
    }
}

fn validate_specifier(specifier: &str) -> Result<(), AdapterError> {
    let parts: Vec<&str> = specifier.split("::").collect();
    if parts.len() > 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(AdapterError::InvalidSpecifier(specifier.to_string()));
    }
    Ok(())
}

/// Adapter asking a list of adapters in order
#[derive(Default)]
pub struct DelegatingAdapter {
    children: RwLock<Vec<Arc<dyn LanguageAdapter>>>,
}

impl DelegatingAdapter {
    /// Create an adapter with no children
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child adapter
    pub fn register_adapter(&self, adapter: Arc<dyn LanguageAdapter>) {
        self.children.write().push(adapter);
    }

    /// Number of child adapters
    pub fn len(&self) -> usize {
        self.children.read().len()
    }

    /// Whether no child adapters are registered
    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }
}

impl LanguageAdapter for DelegatingAdapter {
    fn create_instance(
        &self,
        specifier: &str,
        capability: Capability,
    ) -> Result<Instance, AdapterError> {
        let children = self.children.read().clone();
        children
            .iter()
            .find_map(|child| child.create_instance(specifier, capability).ok())
            .ok_or_else(|| AdapterError::NotFound(specifier.to_string()))
    }
}
