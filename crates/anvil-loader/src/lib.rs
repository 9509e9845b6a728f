//! Anvil transforming class loader
//!
//! Intercepts every class the game or a mod asks for, runs it through an
//! ordered pipeline of transformations and defines the result into a
//! [`ClassHost`]. The pieces:
//!
//! - [`CodeUnit`]: a class as raw bytes or a decoded tree, with queued edits
//! - [`TransformationPipeline`]: external transformations per target, then
//!   built-ins, short-circuiting on skip or failure
//! - [`HierarchyOracle`]: common-ancestor answers for frame computation,
//!   built from class headers only
//! - [`TransformingLoader`]: per-name locked resolution and definition
//! - [`LoaderContext`]: wires configuration, content, mods and the loader
//!   together; runs loader plugins, the game or an audit
//!
//! # Example
//!
//! ```ignore
//! let config = LoaderConfig::from_file(Path::new("anvil.toml"))?;
//! let context = LoaderContext::builder(config)
//!     .game(GameDescriptor::new(game_content, "game.Main"))
//!     .add_mod(my_mod)
//!     .adapter(adapter)
//!     .build()?;
//! context.init()?;
//! context.run()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod adapter;
pub mod audit;
pub mod config;
pub mod content;
pub mod context;
pub mod error;
pub mod hierarchy;
pub mod host;
pub mod ignore;
pub mod loader;
pub mod pipeline;
pub mod registry;
pub mod side;
pub mod timer;
pub mod unit;

pub use adapter::{
    AdapterError, Capability, DelegatingAdapter, Instance, LanguageAdapter, NativeAdapter,
};
pub use audit::{audit, AuditEntry, AuditError, AuditOutcome, AuditReport};
pub use config::{ConfigError, IgnoreConfig, LoaderConfig};
pub use content::{
    ArchiveContent, ContentHandle, ContentSource, DirectoryContent, EmptyContent, LayeredContent,
    MemoryContent,
};
pub use context::{
    EntrypointSpec, GameDescriptor, LoaderContext, LoaderContextBuilder, LoaderPlugin,
    ModDescriptor, RunOutcome, TransformationSpec, LOADER_PLUGIN_ENTRYPOINT,
};
pub use error::LoaderError;
pub use hierarchy::{HeaderSource, HierarchyError, HierarchyNode, HierarchyOracle};
pub use host::{ClassHandle, ClassHost, DefineError};
pub use ignore::IgnoreSet;
pub use loader::{
    ContentHeaderSource, ProcessOutcome, Processed, Resolution, ResolveOutcome,
    TransformingLoader,
};
pub use pipeline::{
    LazyTransformation, Named, PipelineError, PipelineOutcome, Transformation,
    TransformationPipeline, TransformationRegistration,
};
pub use registry::{ClassRegistry, RegisteredClass};
pub use side::{Side, SideStripping, ONLY_IN_DESCRIPTOR, SIDE_DESCRIPTOR, SIDE_STRIPPING};
pub use timer::{PerfCounter, PerfReport};
pub use unit::{CodeUnit, CodeUnitError, TransformError, TreeEdit};
