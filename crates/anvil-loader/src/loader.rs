//! Transforming loader
//!
//! Resolution of one class name runs through these states:
//!
//! ```text
//! REQUESTED -> ignored      -> DELEGATED | NOT-FOUND
//!           -> fetched      -> PIPELINED -> SKIPPED
//!                                        -> FINALIZED -> DEFINED | DEFINE-ERROR
//!           -> not in content -> DELEGATED | NOT-FOUND
//! ```
//!
//! A per-name lock is held for the whole span and the outcome, failures
//! included, is stored. Every later or concurrent request for the same name
//! observes the first caller's outcome, so a class is defined at most once.

use crate::content::ContentSource;
use crate::error::LoaderError;
use crate::hierarchy::{HeaderSource, HierarchyError, HierarchyNode, HierarchyOracle};
use crate::host::{ClassHandle, ClassHost};
use crate::ignore::IgnoreSet;
use crate::pipeline::{PipelineError, PipelineOutcome, TransformationPipeline};
use crate::timer::PerfCounter;
use crate::unit::{CodeUnit, CodeUnitError, TransformError};
use anvil_bytecode::{entry_name, ClassHeader, FrameError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Terminal state of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The class was transformed and defined
    Defined(ClassHandle),
    /// The class was resolved by the host's bootstrap tier
    Delegated(ClassHandle),
    /// No such class
    NotFound,
    /// A transformation decided the class must not be defined
    Skipped {
        /// Name of the skipping transformation
        by: String,
    },
}

/// Stored result of resolving one name
pub type ResolveOutcome = Result<Resolution, Arc<LoaderError>>;

/// Final bytes of a class that was not skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    /// Bytes to define
    pub bytes: Vec<u8>,
    /// Transformations that ran, in order
    pub history: Vec<String>,
}

/// Result of running a class through the pipeline without defining it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The class is ready to be defined
    Finalized(Processed),
    /// A transformation skipped the class
    Skipped {
        /// Name of the skipping transformation
        by: String,
    },
}

/// Reads hierarchy nodes from raw class headers
///
/// Content is read with [`ClassHeader::read`], which never decodes past the
/// interface list. Names missing from content fall back to the host's
/// bootstrap tier.
pub struct ContentHeaderSource {
    content: Arc<dyn ContentSource>,
    host: Arc<dyn ClassHost>,
}

impl ContentHeaderSource {
    /// Create a header source
    pub fn new(content: Arc<dyn ContentSource>, host: Arc<dyn ClassHost>) -> Self {
        Self { content, host }
    }
}

impl HeaderSource for ContentHeaderSource {
    fn read_header(&self, name: &str) -> Result<Option<HierarchyNode>, HierarchyError> {
        let failed = |message: String| HierarchyError::Header {
            name: name.to_string(),
            message,
        };
        match self.content.read(&entry_name(name)).map_err(|e| failed(e.to_string()))? {
            Some(bytes) => {
                let header = ClassHeader::read(&bytes).map_err(|e| failed(e.to_string()))?;
                trace!("read header of {}", name);
                Ok(Some(header.into()))
            }
            None => Ok(self.host.bootstrap_hierarchy(name)),
        }
    }
}

struct LoaderPerf {
    read: PerfCounter,
    transform: PerfCounter,
    define: PerfCounter,
}

type Slot = Arc<Mutex<Option<ResolveOutcome>>>;

/// Resolves, transforms and defines classes
pub struct TransformingLoader {
    content: Arc<dyn ContentSource>,
    pipeline: Arc<TransformationPipeline>,
    oracle: Arc<HierarchyOracle>,
    ignore: Arc<IgnoreSet>,
    host: Arc<dyn ClassHost>,
    slots: DashMap<String, Slot>,
    perf: LoaderPerf,
}

impl TransformingLoader {
    /// Create a loader
    ///
    /// # Arguments
    ///
    /// * `content` - Layered content classes are fetched from
    /// * `pipeline` - Transformations applied to every fetched class
    /// * `oracle` - Hierarchy answers used when re-encoding
    /// * `ignore` - Names resolved by the host instead of the pipeline
    /// * `host` - Runtime classes are defined into
    /// * `show_perf` - Enable the read/transform/define counters
    pub fn new(
        content: Arc<dyn ContentSource>,
        pipeline: Arc<TransformationPipeline>,
        oracle: Arc<HierarchyOracle>,
        ignore: Arc<IgnoreSet>,
        host: Arc<dyn ClassHost>,
        show_perf: bool,
    ) -> Self {
        Self {
            content,
            pipeline,
            oracle,
            ignore,
            host,
            slots: DashMap::new(),
            perf: LoaderPerf {
                read: PerfCounter::new("read", show_perf),
                transform: PerfCounter::new("transform", show_perf),
                define: PerfCounter::new("define", show_perf),
            },
        }
    }

    /// Resolve `name` and define it if needed
    ///
    /// Concurrent calls for the same name block until the first finishes
    /// and then return its outcome.
    pub fn resolve_and_define(&self, name: &str) -> ResolveOutcome {
        let slot = Arc::clone(self.slots.entry(name.to_string()).or_default().value());
        let mut stored = slot.lock();
        if let Some(outcome) = stored.as_ref() {
            return outcome.clone();
        }

        let outcome = self.resolve(name).map_err(Arc::new);
        match &outcome {
            Ok(resolution) => debug!("resolved {}: {:?}", name, resolution),
            Err(error) => warn!("failed to load {}: {}", name, error),
        }
        *stored = Some(outcome.clone());
        outcome
    }

    /// Stored outcome for `name`, if it has been resolved
    pub fn outcome(&self, name: &str) -> Option<ResolveOutcome> {
        let slot = self.slots.get(name).map(|s| Arc::clone(s.value()))?;
        let stored = slot.lock();
        stored.clone()
    }

    /// Read the raw bytes of a class from content
    pub fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>, LoaderError> {
        Ok(self.perf.read.measure(|| self.content.read(&entry_name(name)))?)
    }

    /// Run a class through the pipeline and finalize it without defining it
    ///
    /// Live loading and audit mode both go through here, so both produce the
    /// same bytes.
    pub fn process(&self, name: &str, bytes: Vec<u8>) -> Result<ProcessOutcome, LoaderError> {
        self.perf.transform.measure(|| -> Result<ProcessOutcome, LoaderError> {
            let mut unit = CodeUnit::new(name, bytes);
            let outcome = self
                .pipeline
                .apply(&mut unit)
                .map_err(|e| classify_pipeline(name, e))?;
            if let PipelineOutcome::Skipped { by } = outcome {
                return Ok(ProcessOutcome::Skipped { by });
            }

            let history = unit.history().to_vec();
            let bytes = unit
                .finalize(self.oracle.as_ref())
                .map_err(|e| classify_unit(name, e))?;
            Ok(ProcessOutcome::Finalized(Processed { bytes, history }))
        })
    }

    /// Log and reset the performance counters
    pub fn report_perf(&self) {
        self.perf.read.report();
        self.perf.transform.report();
        self.perf.define.report();
    }

    /// Content classes are fetched from
    pub fn content(&self) -> &Arc<dyn ContentSource> {
        &self.content
    }

    /// Hierarchy oracle used when re-encoding
    pub fn oracle(&self) -> &Arc<HierarchyOracle> {
        &self.oracle
    }

    fn resolve(&self, name: &str) -> Result<Resolution, LoaderError> {
        if self.ignore.is_ignored(name) {
            trace!("{} is ignored, delegating", name);
            return Ok(self.delegate(name));
        }

        let Some(bytes) = self.fetch(name)? else {
            return Ok(self.delegate(name));
        };

        let processed = match self.process(name, bytes)? {
            ProcessOutcome::Skipped { by } => return Ok(Resolution::Skipped { by }),
            ProcessOutcome::Finalized(processed) => processed,
        };

        let handle = self
            .perf
            .define
            .measure(|| self.host.define_class(name, &processed.bytes))
            .map_err(|reason| LoaderError::Define {
                class: name.to_string(),
                history: processed.history,
                reason,
            })?;
        Ok(Resolution::Defined(handle))
    }

    fn delegate(&self, name: &str) -> Resolution {
        self.host
            .resolve_bootstrap(name)
            .map_or(Resolution::NotFound, Resolution::Delegated)
    }
}

impl std::fmt::Debug for TransformingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformingLoader")
            .field("resolved", &self.slots.len())
            .field("oracle", &self.oracle)
            .finish()
    }
}

fn classify_pipeline(name: &str, error: PipelineError) -> LoaderError {
    match error.source {
        TransformError::Unit(unit_error) => classify_unit(name, *unit_error),
        source => LoaderError::Transform {
            class: name.to_string(),
            transform: error.transform,
            source,
        },
    }
}

fn classify_unit(name: &str, error: CodeUnitError) -> LoaderError {
    let class = name.to_string();
    match error {
        CodeUnitError::Corrupt(source) => LoaderError::CorruptArtifact { class, source },
        CodeUnitError::Edit { origin, source } => LoaderError::Transform {
            class,
            transform: origin,
            source,
        },
        CodeUnitError::Frames(FrameError::Resolver { a, b, source }) => {
            match source.downcast::<HierarchyError>() {
                Ok(source) => LoaderError::Hierarchy {
                    class,
                    source: *source,
                },
                Err(source) => LoaderError::Finalize {
                    class,
                    source: FrameError::Resolver { a, b, source },
                },
            }
        }
        CodeUnitError::Frames(source) => LoaderError::Finalize { class, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NativeAdapter;
    use crate::content::MemoryContent;
    use crate::pipeline::Named;
    use crate::registry::ClassRegistry;
    use anvil_bytecode::{ClassFile, OBJECT_CLASS};

    struct Fixture {
        content: Arc<MemoryContent>,
        pipeline: Arc<TransformationPipeline>,
        registry: Arc<ClassRegistry>,
        loader: TransformingLoader,
    }

    fn fixture() -> Fixture {
        let content = Arc::new(MemoryContent::new());
        let registry = Arc::new(ClassRegistry::new());
        let ignore = Arc::new(IgnoreSet::new());
        ignore.ignore_package("lang");
        let pipeline = Arc::new(TransformationPipeline::new(
            Arc::clone(&ignore),
            Arc::new(NativeAdapter::new()),
        ));
        let oracle = Arc::new(HierarchyOracle::new(Arc::new(ContentHeaderSource::new(
            content.clone(),
            registry.clone(),
        ))));
        let loader = TransformingLoader::new(
            content.clone(),
            Arc::clone(&pipeline),
            oracle,
            ignore,
            registry.clone(),
            true,
        );
        Fixture {
            content,
            pipeline,
            registry,
            loader,
        }
    }

    #[test]
    fn test_defines_untouched_class() {
        let f = fixture();
        let class = ClassFile::new("game.Point", Some(OBJECT_CLASS));
        f.content.insert_class(&class);

        let resolution = f.loader.resolve_and_define("game.Point").unwrap();
        assert!(matches!(resolution, Resolution::Defined(ref h) if &*h.name == "game.Point"));
        assert_eq!(f.registry.define_calls(), 1);
        assert!(matches!(f.loader.outcome("game.Point"), Some(Ok(r)) if r == resolution));
    }

    #[test]
    fn test_ignored_and_missing() {
        let f = fixture();
        assert!(matches!(
            f.loader.resolve_and_define(OBJECT_CLASS).unwrap(),
            Resolution::Delegated(_)
        ));
        assert_eq!(
            f.loader.resolve_and_define("lang.Missing").unwrap(),
            Resolution::NotFound
        );
        assert_eq!(
            f.loader.resolve_and_define("game.Missing").unwrap(),
            Resolution::NotFound
        );
        assert_eq!(f.registry.define_calls(), 0);
    }

    #[test]
    fn test_corrupt_class() {
        let f = fixture();
        f.content.insert("game/Broken.class", b"not a class".to_vec());
        f.pipeline.register_builtin(Named::new("touch", |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.as_tree()?;
            Ok(())
        }));

        let err = f.loader.resolve_and_define("game.Broken").unwrap_err();
        assert!(matches!(*err, LoaderError::CorruptArtifact { .. }));
    }

    #[test]
    fn test_failure_is_stored() {
        let f = fixture();
        f.content.insert_class(&ClassFile::new("game.Point", Some(OBJECT_CLASS)));
        f.pipeline.register_builtin(Named::new("fails", |_: &mut CodeUnit| -> Result<(), TransformError> {
            Err(TransformError::message("no"))
        }));

        let first = f.loader.resolve_and_define("game.Point").unwrap_err();
        let second = f.loader.resolve_and_define("game.Point").unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));
        match &*first {
            LoaderError::Transform { transform, class, .. } => {
                assert_eq!(transform, "fails");
                assert_eq!(class, "game.Point");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_define_error_carries_history() {
        let f = fixture();
        f.content.insert_class(&ClassFile::new("game.Point", Some(OBJECT_CLASS)));
        f.pipeline.register_builtin(Named::new("rename", |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.as_tree()?.header.name = "game.Elsewhere".to_string();
            Ok(())
        }));

        let err = f.loader.resolve_and_define("game.Point").unwrap_err();
        match &*err {
            LoaderError::Define { class, history, .. } => {
                assert_eq!(class, "game.Point");
                assert_eq!(history, &vec!["rename".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_source_falls_back_to_bootstrap() {
        let f = fixture();
        let mut class = ClassFile::new("game.Child", Some("game.Parent"));
        class.header.interfaces.push("game.Marker".to_string());
        f.content.insert_class(&class);

        let source = ContentHeaderSource::new(f.content.clone(), f.registry.clone());
        let node = source.read_header("game.Child").unwrap().unwrap();
        assert_eq!(node.super_name.as_deref(), Some("game.Parent"));
        assert_eq!(node.interfaces, vec!["game.Marker"]);

        let string = source.read_header("lang.String").unwrap().unwrap();
        assert_eq!(string.super_name.as_deref(), Some(OBJECT_CLASS));
        assert!(source.read_header("game.Nothing").unwrap().is_none());
    }
}
