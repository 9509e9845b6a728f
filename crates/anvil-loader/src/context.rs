//! Loader context
//!
//! Owns everything a run needs: configuration, layered content, the ignore
//! set, the pipeline, the hierarchy oracle and the loader. Built once with
//! [`LoaderContextBuilder`] and passed by reference to whoever needs it.

use crate::adapter::{AdapterError, Capability, DelegatingAdapter, Instance, LanguageAdapter};
use crate::audit::{audit, AuditReport};
use crate::config::{ConfigError, LoaderConfig};
use crate::content::{ContentSource, LayeredContent};
use crate::error::LoaderError;
use crate::hierarchy::HierarchyOracle;
use crate::host::{ClassHandle, ClassHost};
use crate::ignore::IgnoreSet;
use crate::loader::{ContentHeaderSource, Resolution, TransformingLoader};
use crate::pipeline::{Named, TransformationPipeline, TransformationRegistration};
use crate::registry::ClassRegistry;
use crate::side::{SideStripping, SIDE_STRIPPING};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Entrypoint id of loader plugins
pub const LOADER_PLUGIN_ENTRYPOINT: &str = "loader_plugin";

/// Hook run by [`LoaderContext::init`]
pub trait LoaderPlugin: Send + Sync {
    /// Called once the context is built, before anything is loaded
    fn on_loader_init(&self, context: &LoaderContext) -> Result<(), LoaderError>;
}

/// The game being launched
#[derive(Clone)]
pub struct GameDescriptor {
    /// Game classes and resources
    pub content: Arc<dyn ContentSource>,
    /// Class whose resolution starts the game
    pub main_class: String,
}

impl GameDescriptor {
    /// Create a game descriptor
    pub fn new(content: Arc<dyn ContentSource>, main_class: impl Into<String>) -> Self {
        Self {
            content,
            main_class: main_class.into(),
        }
    }
}

/// A transformation declared by a mod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationSpec {
    /// Reported name
    pub name: String,
    /// Classes it applies to
    pub targets: Vec<String>,
    /// Specifier handed to the language adapter
    pub specifier: String,
}

/// An entrypoint declared by a mod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrypointSpec {
    /// Entrypoint id, e.g. `loader_plugin`
    pub id: String,
    /// Specifier handed to the language adapter
    pub specifier: String,
}

/// A discovered mod
#[derive(Clone)]
pub struct ModDescriptor {
    /// Mod id
    pub id: String,
    /// Mod classes and resources
    pub content: Arc<dyn ContentSource>,
    /// Declared transformations
    pub transformations: Vec<TransformationSpec>,
    /// Declared entrypoints
    pub entrypoints: Vec<EntrypointSpec>,
}

impl ModDescriptor {
    /// Create a mod with no transformations or entrypoints
    pub fn new(id: impl Into<String>, content: Arc<dyn ContentSource>) -> Self {
        Self {
            id: id.into(),
            content,
            transformations: Vec::new(),
            entrypoints: Vec::new(),
        }
    }

    /// Declare a transformation
    pub fn with_transformation<I, S>(
        mut self,
        name: impl Into<String>,
        targets: I,
        specifier: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transformations.push(TransformationSpec {
            name: name.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            specifier: specifier.into(),
        });
        self
    }

    /// Declare an entrypoint
    pub fn with_entrypoint(mut self, id: impl Into<String>, specifier: impl Into<String>) -> Self {
        self.entrypoints.push(EntrypointSpec {
            id: id.into(),
            specifier: specifier.into(),
        });
        self
    }

    fn registrations(&self) -> impl Iterator<Item = TransformationRegistration> + '_ {
        self.transformations
            .iter()
            .map(move |spec| TransformationRegistration {
                name: spec.name.clone(),
                targets: spec.targets.clone(),
                specifier: spec.specifier.clone(),
                origin: self.id.clone(),
            })
    }
}

impl std::fmt::Debug for ModDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModDescriptor")
            .field("id", &self.id)
            .field("transformations", &self.transformations)
            .field("entrypoints", &self.entrypoints)
            .finish()
    }
}

/// How [`LoaderContext::run`] ended
#[derive(Debug)]
pub enum RunOutcome {
    /// The main class was resolved
    Started(ClassHandle),
    /// Audit mode wrote its archive
    Audited(AuditReport),
}

/// Builder for [`LoaderContext`]
pub struct LoaderContextBuilder {
    config: LoaderConfig,
    game: Option<GameDescriptor>,
    mods: Vec<ModDescriptor>,
    libraries: Vec<Arc<dyn ContentSource>>,
    adapter: Option<Arc<dyn LanguageAdapter>>,
    host: Option<Arc<dyn ClassHost>>,
}

impl LoaderContextBuilder {
    /// Set the game
    pub fn game(mut self, game: GameDescriptor) -> Self {
        self.game = Some(game);
        self
    }

    /// Add a mod discovered before the first load
    pub fn add_mod(mut self, descriptor: ModDescriptor) -> Self {
        self.mods.push(descriptor);
        self
    }

    /// Add library content, consulted after the game
    pub fn library(mut self, content: Arc<dyn ContentSource>) -> Self {
        self.libraries.push(content);
        self
    }

    /// Set the language adapter (default: an empty [`DelegatingAdapter`])
    pub fn adapter(mut self, adapter: Arc<dyn LanguageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Set the class host (default: a fresh [`ClassRegistry`])
    pub fn host(mut self, host: Arc<dyn ClassHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Wire everything together
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, no game was set or two mods
    /// share an id.
    pub fn build(self) -> Result<LoaderContext, LoaderError> {
        self.config.validate()?;
        let game = self
            .game
            .ok_or_else(|| ConfigError::MissingField("game".to_string()))?;
        check_unique_ids(&[], &self.mods)?;

        let ignore = Arc::new(IgnoreSet::new());
        ignore.ignore_package("lang");
        ignore.ignore_package_absolute("anvil");
        for package in &self.config.ignore.packages {
            ignore.ignore_package(package.as_str());
        }
        for package in &self.config.ignore.absolute_packages {
            ignore.ignore_package_absolute(package.as_str());
        }
        for class in &self.config.ignore.classes {
            ignore.ignore_class(class.as_str());
        }

        let layers = self
            .mods
            .iter()
            .map(|m| Arc::clone(&m.content))
            .chain(std::iter::once(Arc::clone(&game.content)))
            .chain(self.libraries.iter().cloned());
        let content = Arc::new(LayeredContent::new(layers));

        let adapter: Arc<dyn LanguageAdapter> = match self.adapter {
            Some(adapter) => adapter,
            None => Arc::new(DelegatingAdapter::new()),
        };
        let host: Arc<dyn ClassHost> = match self.host {
            Some(host) => host,
            None => Arc::new(ClassRegistry::new()),
        };

        let oracle = Arc::new(HierarchyOracle::with_base(
            self.config.universal_base.clone(),
            Arc::new(ContentHeaderSource::new(content.clone(), Arc::clone(&host))),
        ));

        let pipeline = Arc::new(TransformationPipeline::new(
            Arc::clone(&ignore),
            Arc::clone(&adapter),
        ));
        pipeline.register_builtin(Named::new(SIDE_STRIPPING, SideStripping::new(self.config.side)));
        pipeline.on_targets_discovered(self.mods.iter().flat_map(ModDescriptor::registrations));

        let loader = Arc::new(TransformingLoader::new(
            content.clone(),
            Arc::clone(&pipeline),
            Arc::clone(&oracle),
            Arc::clone(&ignore),
            Arc::clone(&host),
            self.config.show_perf,
        ));

        info!(
            side = %self.config.side,
            mods = self.mods.len(),
            libraries = self.libraries.len(),
            "loading {} with mods [{}]",
            game.main_class,
            self.mods.iter().map(|m| m.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(LoaderContext {
            config: self.config,
            game,
            mods: RwLock::new(self.mods),
            library_count: self.libraries.len(),
            content,
            adapter,
            host,
            ignore,
            oracle,
            pipeline,
            loader,
        })
    }
}

/// A configured loader run
pub struct LoaderContext {
    config: LoaderConfig,
    game: GameDescriptor,
    mods: RwLock<Vec<ModDescriptor>>,
    library_count: usize,
    content: Arc<LayeredContent>,
    adapter: Arc<dyn LanguageAdapter>,
    host: Arc<dyn ClassHost>,
    ignore: Arc<IgnoreSet>,
    oracle: Arc<HierarchyOracle>,
    pipeline: Arc<TransformationPipeline>,
    loader: Arc<TransformingLoader>,
}

impl LoaderContext {
    /// Start building a context
    pub fn builder(config: LoaderConfig) -> LoaderContextBuilder {
        LoaderContextBuilder {
            config,
            game: None,
            mods: Vec::new(),
            libraries: Vec::new(),
            adapter: None,
            host: None,
        }
    }

    /// Run every `loader_plugin` entrypoint, in mod order
    pub fn init(&self) -> Result<(), LoaderError> {
        if self.config.print_class_path {
            self.print_class_path();
        }

        let plugins = self.instantiate(LOADER_PLUGIN_ENTRYPOINT, Capability::LoaderPlugin)?;
        debug!("running {} loader plugins", plugins.len());
        for (specifier, instance) in plugins {
            let found = instance.capability();
            let plugin = instance
                .into_loader_plugin()
                .ok_or(AdapterError::CapabilityMismatch {
                    specifier,
                    expected: Capability::LoaderPlugin,
                    found,
                })?;
            plugin.on_loader_init(self)?;
        }
        Ok(())
    }

    /// Add mods found by a later discovery stage
    ///
    /// Their content is layered after the mods already known and before the
    /// game. Their transformations are appended after existing ones for the
    /// same target.
    pub fn discover_mods(&self, discovered: Vec<ModDescriptor>) -> Result<(), LoaderError> {
        let mut mods = self.mods.write();
        check_unique_ids(&mods, &discovered)?;

        for descriptor in &discovered {
            self.content.insert(mods.len(), Arc::clone(&descriptor.content));
            self.pipeline.on_targets_discovered(descriptor.registrations());
            info!("discovered mod {}", descriptor.id);
            mods.push(descriptor.clone());
        }
        Ok(())
    }

    /// Audit or start the game, depending on configuration
    ///
    /// # Returns
    ///
    /// * `RunOutcome::Audited` - When an audit path is configured
    /// * `RunOutcome::Started` - With the handle of the game's main class
    pub fn run(&self) -> Result<RunOutcome, LoaderError> {
        let outcome = match &self.config.audit {
            Some(output) => RunOutcome::Audited(audit(&self.loader, self.game.content.as_ref(), output)?),
            None => RunOutcome::Started(self.start()?),
        };
        self.loader.report_perf();
        Ok(outcome)
    }

    /// Instantiate every entrypoint with `id`, in mod order
    pub fn call_entrypoint(
        &self,
        id: &str,
        capability: Capability,
    ) -> Result<Vec<Instance>, LoaderError> {
        let instances = self.instantiate(id, capability)?;
        Ok(instances.into_iter().map(|(_, instance)| instance).collect())
    }

    /// Instances paired with their specifiers. Adapters returning another
    /// capability than requested are rejected.
    fn instantiate(
        &self,
        id: &str,
        capability: Capability,
    ) -> Result<Vec<(String, Instance)>, LoaderError> {
        let specifiers: Vec<String> = self
            .mods
            .read()
            .iter()
            .flat_map(|m| m.entrypoints.iter())
            .filter(|e| e.id == id)
            .map(|e| e.specifier.clone())
            .collect();

        specifiers
            .into_iter()
            .map(|specifier| {
                let instance = self.adapter.create_instance(&specifier, capability)?;
                let found = instance.capability();
                if found != capability {
                    return Err(AdapterError::CapabilityMismatch {
                        specifier,
                        expected: capability,
                        found,
                    }
                    .into());
                }
                Ok((specifier, instance))
            })
            .collect()
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The game being launched
    pub fn game(&self) -> &GameDescriptor {
        &self.game
    }

    /// Ids of the known mods, in discovery order
    pub fn mod_ids(&self) -> Vec<String> {
        self.mods.read().iter().map(|m| m.id.clone()).collect()
    }

    /// The transforming loader
    pub fn loader(&self) -> &Arc<TransformingLoader> {
        &self.loader
    }

    /// The transformation pipeline
    pub fn pipeline(&self) -> &Arc<TransformationPipeline> {
        &self.pipeline
    }

    /// The hierarchy oracle
    pub fn oracle(&self) -> &Arc<HierarchyOracle> {
        &self.oracle
    }

    /// Names kept out of the pipeline
    pub fn ignore_set(&self) -> &Arc<IgnoreSet> {
        &self.ignore
    }

    /// Layered content: mods, then the game, then libraries
    pub fn content(&self) -> &Arc<LayeredContent> {
        &self.content
    }

    /// The class host
    pub fn host(&self) -> &Arc<dyn ClassHost> {
        &self.host
    }

    fn start(&self) -> Result<ClassHandle, LoaderError> {
        let main = &self.game.main_class;
        let resolution = self
            .loader
            .resolve_and_define(main)
            .map_err(|source| LoaderError::Resolve {
                class: main.clone(),
                source,
            })?;
        match resolution {
            Resolution::Defined(handle) | Resolution::Delegated(handle) => {
                info!("started {}", main);
                Ok(handle)
            }
            Resolution::NotFound => Err(LoaderError::MainClassNotFound(main.clone())),
            Resolution::Skipped { by } => Err(LoaderError::MainClassSkipped {
                class: main.clone(),
                by,
            }),
        }
    }

    fn print_class_path(&self) {
        let mods = self.mods.read();
        for m in mods.iter() {
            info!("class path: mod {}", m.id);
        }
        info!("class path: game");
        if self.library_count > 0 {
            info!("class path: {} libraries", self.library_count);
        }
    }
}

impl std::fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderContext")
            .field("config", &self.config)
            .field("main_class", &self.game.main_class)
            .field("mods", &self.mod_ids())
            .field("loader", &self.loader)
            .finish()
    }
}

fn check_unique_ids(known: &[ModDescriptor], added: &[ModDescriptor]) -> Result<(), ConfigError> {
    let mut seen: FxHashSet<&str> = known.iter().map(|m| m.id.as_str()).collect();
    for descriptor in added {
        if !seen.insert(descriptor.id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Duplicate mod id: {}",
                descriptor.id
            )));
        }
    }
    Ok(())
}
