//! Transformation pipeline
//!
//! External transformations are contributed by mods and registered per
//! target class; built-ins run on every class after them. Both lists keep
//! registration order, and the fold stops at the first transformation that
//! skips the unit or fails.

use crate::adapter::{AdapterError, Capability, LanguageAdapter};
use crate::ignore::IgnoreSet;
use crate::unit::{CodeUnit, CodeUnitError, TransformError};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// A class transformation
pub trait Transformation: Send + Sync {
    /// Transform `unit` in place
    ///
    /// Marking the unit skipped or returning an error stops the pipeline
    /// for this unit.
    fn transform(&self, unit: &mut CodeUnit) -> Result<(), TransformError>;
}

impl<F> Transformation for F
where
    F: Fn(&mut CodeUnit) -> Result<(), TransformError> + Send + Sync,
{
    fn transform(&self, unit: &mut CodeUnit) -> Result<(), TransformError> {
        self(unit)
    }
}

/// A transformation together with the name it is reported under
#[derive(Clone)]
pub struct Named {
    name: String,
    inner: Arc<dyn Transformation>,
}

impl Named {
    /// Name a transformation
    pub fn new<T>(name: impl Into<String>, transformation: T) -> Self
    where
        T: Transformation + 'static,
    {
        Self::from_arc(name, Arc::new(transformation))
    }

    /// Name a shared transformation
    pub fn from_arc(name: impl Into<String>, inner: Arc<dyn Transformation>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    /// Reported name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transformation for Named {
    fn transform(&self, unit: &mut CodeUnit) -> Result<(), TransformError> {
        self.inner.transform(unit)
    }
}

impl std::fmt::Debug for Named {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Named").field(&self.name).finish()
    }
}

/// An external transformation contributed by a mod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationRegistration {
    /// Name the transformation is reported under
    pub name: String,
    /// Classes the transformation applies to
    pub targets: Vec<String>,
    /// Specifier handed to the language adapter
    pub specifier: String,
    /// Id of the contributing mod
    pub origin: String,
}

/// An external transformation instantiated on first use
///
/// The instance, or the instantiation failure, is kept for every later use
/// and shared by every target of the registration.
pub struct LazyTransformation {
    registration: TransformationRegistration,
    adapter: Arc<dyn LanguageAdapter>,
    instance: OnceCell<Result<Arc<dyn Transformation>, AdapterError>>,
}

impl LazyTransformation {
    /// Defer instantiation of `registration` through `adapter`
    pub fn new(registration: TransformationRegistration, adapter: Arc<dyn LanguageAdapter>) -> Self {
        Self {
            registration,
            adapter,
            instance: OnceCell::new(),
        }
    }

    /// Reported name
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// The registration this was created from
    pub fn registration(&self) -> &TransformationRegistration {
        &self.registration
    }

    /// Whether instantiation has been attempted
    pub fn is_initialized(&self) -> bool {
        self.instance.get().is_some()
    }

    fn instance(&self) -> Result<Arc<dyn Transformation>, AdapterError> {
        self.instance
            .get_or_init(|| {
                let specifier = &self.registration.specifier;
                debug!(
                    "instantiating transformation {} from {} ({})",
                    self.registration.name, self.registration.origin, specifier
                );
                let instance = self
                    .adapter
                    .create_instance(specifier, Capability::Transformation)?;
                let found = instance.capability();
                instance
                    .into_transformation()
                    .ok_or_else(|| AdapterError::CapabilityMismatch {
                        specifier: specifier.clone(),
                        expected: Capability::Transformation,
                        found,
                    })
            })
            .clone()
    }
}

impl Transformation for LazyTransformation {
    fn transform(&self, unit: &mut CodeUnit) -> Result<(), TransformError> {
        self.instance()?.transform(unit)
    }
}

impl std::fmt::Debug for LazyTransformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyTransformation")
            .field("registration", &self.registration)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// A transformation failed while the pipeline ran
#[derive(Debug, Error)]
#[error("Transformation {transform} failed: {source}")]
pub struct PipelineError {
    /// Name of the failing transformation
    pub transform: String,
    /// Failure
    pub source: TransformError,
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The class is in the ignore set and was left alone
    Ignored,
    /// Every applicable transformation ran
    Completed,
    /// A transformation marked the unit skipped
    Skipped {
        /// Name of the skipping transformation
        by: String,
    },
}

/// Ordered external and built-in transformations
pub struct TransformationPipeline {
    ignore: Arc<IgnoreSet>,
    adapter: Arc<dyn LanguageAdapter>,
    builtins: RwLock<Vec<Named>>,
    externals: RwLock<FxHashMap<String, Vec<Arc<LazyTransformation>>>>,
}

impl TransformationPipeline {
    /// Create an empty pipeline
    ///
    /// # Arguments
    ///
    /// * `ignore` - Names that bypass every transformation
    /// * `adapter` - Adapter instantiating external transformations
    pub fn new(ignore: Arc<IgnoreSet>, adapter: Arc<dyn LanguageAdapter>) -> Self {
        Self {
            ignore,
            adapter,
            builtins: RwLock::new(Vec::new()),
            externals: RwLock::new(FxHashMap::default()),
        }
    }

    /// Append a built-in transformation
    pub fn register_builtin(&self, transformation: Named) {
        debug!("registering built-in transformation {}", transformation.name());
        self.builtins.write().push(transformation);
    }

    /// Merge newly discovered external transformations
    ///
    /// Entries already registered for a target stay ahead of new ones; new
    /// entries keep their input order. Each registration is instantiated at
    /// most once, whichever of its targets loads first.
    pub fn on_targets_discovered(&self, registrations: impl IntoIterator<Item = TransformationRegistration>) {
        let mut externals = self.externals.write();
        for registration in registrations {
            trace!(
                "registering {} for {:?} from {}",
                registration.name,
                registration.targets,
                registration.origin
            );
            let targets = registration.targets.clone();
            let lazy = Arc::new(LazyTransformation::new(registration, Arc::clone(&self.adapter)));
            for target in targets {
                externals.entry(target).or_default().push(Arc::clone(&lazy));
            }
        }
    }

    /// Names of the built-ins, in order
    pub fn builtin_names(&self) -> Vec<String> {
        self.builtins.read().iter().map(|t| t.name().to_string()).collect()
    }

    /// External transformations registered for `target`, in order
    pub fn externals_for(&self, target: &str) -> Vec<TransformationRegistration> {
        self.externals
            .read()
            .get(target)
            .map(|list| list.iter().map(|t| t.registration().clone()).collect())
            .unwrap_or_default()
    }

    /// Run every applicable transformation over `unit`
    ///
    /// # Returns
    ///
    /// * `Ok(PipelineOutcome)` - How the run ended
    /// * `Err(PipelineError)` - The first failure, naming the transformation
    ///   responsible
    pub fn apply(&self, unit: &mut CodeUnit) -> Result<PipelineOutcome, PipelineError> {
        if self.ignore.is_ignored(unit.name()) {
            return Ok(PipelineOutcome::Ignored);
        }

        let externals = self
            .externals
            .read()
            .get(unit.name())
            .cloned()
            .unwrap_or_default();
        for external in &externals {
            debug!("transforming {} with {}", unit.name(), external.name());
            if let Some(outcome) = run(unit, external.name(), external.as_ref())? {
                return Ok(outcome);
            }
        }

        let builtins = self.builtins.read().clone();
        for builtin in &builtins {
            trace!("transforming {} with {}", unit.name(), builtin.name());
            if let Some(outcome) = run(unit, builtin.name(), builtin)? {
                return Ok(outcome);
            }
        }

        Ok(PipelineOutcome::Completed)
    }
}

/// Run one transformation, returning an outcome when the pipeline must stop
fn run(
    unit: &mut CodeUnit,
    name: &str,
    transformation: &dyn Transformation,
) -> Result<Option<PipelineOutcome>, PipelineError> {
    unit.enter(name);
    let result = transformation.transform(unit);
    unit.leave();

    if let Err(source) = result {
        let transform = match &source {
            TransformError::Unit(error) => match error.as_ref() {
                CodeUnitError::Edit { origin, .. } => origin.clone(),
                _ => name.to_string(),
            },
            _ => name.to_string(),
        };
        return Err(PipelineError { transform, source });
    }

    Ok(unit.skipped_by().map(|by| {
        debug!("{} skipped by {}", unit.name(), by);
        PipelineOutcome::Skipped { by: by.to_string() }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NativeAdapter;
    use anvil_bytecode::{Annotation, ClassFile, OBJECT_CLASS};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit(name: &str) -> CodeUnit {
        CodeUnit::new(name, ClassFile::new(name, Some(OBJECT_CLASS)).encode())
    }

    fn marker(tag: &'static str) -> impl Transformation {
        move |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.as_tree()?
                .annotations
                .push(Annotation::new(format!("Lmarker.{};", tag)));
            Ok(())
        }
    }

    fn registration(name: &str, target: &str) -> TransformationRegistration {
        TransformationRegistration {
            name: name.to_string(),
            targets: vec![target.to_string()],
            specifier: format!("mods.{}", name),
            origin: "testmod".to_string(),
        }
    }

    fn pipeline(adapter: Arc<NativeAdapter>) -> TransformationPipeline {
        TransformationPipeline::new(Arc::new(IgnoreSet::new()), adapter)
    }

    fn markers(unit: &mut CodeUnit) -> Vec<String> {
        unit.as_tree()
            .unwrap()
            .annotations
            .iter()
            .map(|a| a.descriptor.clone())
            .collect()
    }

    #[test]
    fn test_ignored_unit_is_untouched() {
        let ignore = Arc::new(IgnoreSet::new());
        ignore.ignore_package("lang");
        let pipeline = TransformationPipeline::new(ignore, Arc::new(NativeAdapter::new()));
        pipeline.register_builtin(Named::new("mark", marker("builtin")));

        let mut unit = unit("lang.Thread");
        assert_eq!(pipeline.apply(&mut unit).unwrap(), PipelineOutcome::Ignored);
        assert!(unit.history().is_empty());
        assert!(!unit.is_tree());
    }

    #[test]
    fn test_externals_run_before_builtins() {
        let adapter = Arc::new(NativeAdapter::new());
        adapter.register_transformation("mods.t1", marker("t1")).unwrap();
        let pipeline = pipeline(Arc::clone(&adapter));
        pipeline.register_builtin(Named::new("builtin", marker("builtin")));
        pipeline.on_targets_discovered([registration("t1", "game.Foo")]);

        let mut unit = unit("game.Foo");
        assert_eq!(pipeline.apply(&mut unit).unwrap(), PipelineOutcome::Completed);
        assert_eq!(unit.history(), ["t1", "builtin"]);
        assert_eq!(markers(&mut unit), vec!["Lmarker.t1;", "Lmarker.builtin;"]);
    }

    #[test]
    fn test_stable_merge_keeps_existing_first() {
        let adapter = Arc::new(NativeAdapter::new());
        let pipeline = pipeline(adapter);
        pipeline.on_targets_discovered([registration("a", "game.Foo"), registration("b", "game.Foo")]);
        pipeline.on_targets_discovered([registration("c", "game.Foo"), registration("d", "game.Bar")]);

        let names: Vec<_> = pipeline
            .externals_for("game.Foo")
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(pipeline.externals_for("game.Bar").len(), 1);
        assert!(pipeline.externals_for("game.Baz").is_empty());
    }

    #[test]
    fn test_skip_short_circuits() {
        let later_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&later_runs);
        let pipeline = pipeline(Arc::new(NativeAdapter::new()));
        pipeline.register_builtin(Named::new("skipper", |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.mark_skipped();
            Ok(())
        }));
        pipeline.register_builtin(Named::new("later", move |_: &mut CodeUnit| -> Result<(), TransformError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut unit = unit("game.Foo");
        assert_eq!(
            pipeline.apply(&mut unit).unwrap(),
            PipelineOutcome::Skipped {
                by: "skipper".to_string()
            }
        );
        assert_eq!(later_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_names_transformation() {
        let pipeline = pipeline(Arc::new(NativeAdapter::new()));
        pipeline.register_builtin(Named::new("broken", |_: &mut CodeUnit| -> Result<(), TransformError> {
            Err(TransformError::message("nope"))
        }));

        let err = pipeline.apply(&mut unit("game.Foo")).unwrap_err();
        assert_eq!(err.transform, "broken");
    }

    #[test]
    fn test_failing_queued_edit_blames_its_origin() {
        let pipeline = pipeline(Arc::new(NativeAdapter::new()));
        pipeline.register_builtin(Named::new("queues", |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.queue_tree_edit(|_| Err(TransformError::message("bad edit")));
            Ok(())
        }));
        pipeline.register_builtin(Named::new("reads", |unit: &mut CodeUnit| -> Result<(), TransformError> {
            unit.as_tree()?;
            Ok(())
        }));

        let err = pipeline.apply(&mut unit("game.Foo")).unwrap_err();
        assert_eq!(err.transform, "queues");
    }

    #[test]
    fn test_lazy_instantiation_failure_is_memoized() {
        let adapter = Arc::new(NativeAdapter::new());
        let pipeline = pipeline(adapter);
        pipeline.on_targets_discovered([registration("missing", "game.Foo")]);

        for _ in 0..2 {
            let err = pipeline.apply(&mut unit("game.Foo")).unwrap_err();
            assert_eq!(err.transform, "missing");
            assert!(matches!(err.source, TransformError::Adapter(_)));
        }
    }

    #[test]
    fn test_lazy_instantiates_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let adapter = Arc::new(NativeAdapter::new());
        let counter = Arc::clone(&created);
        adapter
            .register("mods.t1", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                crate::adapter::Instance::Transformation(Arc::new(marker("t1")))
            })
            .unwrap();
        let pipeline = pipeline(adapter);
        pipeline.on_targets_discovered([registration("t1", "game.Foo")]);

        pipeline.apply(&mut unit("game.Foo")).unwrap();
        pipeline.apply(&mut unit("game.Foo")).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_shared_across_targets() {
        let created = Arc::new(AtomicUsize::new(0));
        let adapter = Arc::new(NativeAdapter::new());
        let counter = Arc::clone(&created);
        adapter
            .register("mods.shared", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                crate::adapter::Instance::Transformation(Arc::new(marker("shared")))
            })
            .unwrap();
        let pipeline = pipeline(adapter);
        let mut shared = registration("shared", "game.A");
        shared.targets.extend(["game.B".to_string(), "game.C".to_string()]);
        pipeline.on_targets_discovered([registration("first", "game.B"), shared]);

        for target in ["game.A", "game.B", "game.C"] {
            assert_eq!(pipeline.externals_for(target).last().unwrap().name, "shared");
        }
        assert_eq!(pipeline.externals_for("game.B").len(), 2);
        for target in ["game.A", "game.C"] {
            let mut class = unit(target);
            pipeline.apply(&mut class).unwrap();
            assert_eq!(markers(&mut class), vec!["Lmarker.shared;"]);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
