//! Code units
//!
//! A [`CodeUnit`] is one class on its way through the pipeline. It starts as
//! the raw bytes read from content and is only decoded when a transformation
//! asks for the tree. Edits are queued rather than applied: visitor wraps run
//! while the bytes are decoded, tree edits run afterwards in the order they
//! were queued. A unit that nobody touched is finalized without ever being
//! decoded.

use crate::adapter::AdapterError;
use anvil_bytecode::{ClassFile, ClassFileError, ClassVisitor, FrameError, SuperClassResolver};
use std::borrow::Cow;
use thiserror::Error;

/// Origin recorded for operations queued outside of any transformation
const DIRECT: &str = "<direct>";

/// A queued edit over the decoded tree
pub type TreeEdit = Box<dyn FnOnce(&mut ClassFile) -> Result<(), TransformError> + Send>;

/// Errors a transformation reports
#[derive(Debug, Error)]
pub enum TransformError {
    /// Free-form failure
    #[error("{0}")]
    Message(String),

    /// The unit could not be materialized
    #[error(transparent)]
    Unit(Box<CodeUnitError>),

    /// The transformation could not be instantiated
    #[error("Instantiation failed: {0}")]
    Adapter(#[from] AdapterError),

    /// Any other failure
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TransformError {
    /// Create a free-form failure
    pub fn message(message: impl Into<String>) -> Self {
        TransformError::Message(message.into())
    }
}

impl From<CodeUnitError> for TransformError {
    fn from(error: CodeUnitError) -> Self {
        TransformError::Unit(Box::new(error))
    }
}

/// Errors materializing or finalizing a unit
#[derive(Debug, Error)]
pub enum CodeUnitError {
    /// The bytes are not a valid class file
    #[error("Corrupt class file: {0}")]
    Corrupt(#[from] ClassFileError),

    /// Frames could not be recomputed
    #[error("Frame computation failed: {0}")]
    Frames(#[from] FrameError),

    /// A queued tree edit failed
    #[error("Edit queued by {origin} failed: {source}")]
    Edit {
        /// Transformation that queued the edit
        origin: String,
        /// Edit failure
        source: TransformError,
    },
}

enum Representation {
    Raw(Vec<u8>),
    Tree(Box<ClassFile>),
}

enum PendingOp {
    VisitorWrap(Box<dyn ClassVisitor + Send>),
    TreeEdit(TreeEdit),
}

struct Pending {
    origin: String,
    op: PendingOp,
}

/// A class being transformed
pub struct CodeUnit {
    name: String,
    repr: Representation,
    pending: Vec<Pending>,
    skipped_by: Option<String>,
    history: Vec<String>,
    active: Option<String>,
}

impl CodeUnit {
    /// Wrap raw class bytes
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            repr: Representation::Raw(bytes),
            pending: Vec::new(),
            skipped_by: None,
            history: Vec::new(),
            active: None,
        }
    }

    /// Wrap an already decoded class
    pub fn from_tree(class: ClassFile) -> Self {
        let mut unit = Self::new(class.name().to_string(), Vec::new());
        unit.repr = Representation::Tree(Box::new(class));
        unit
    }

    /// Qualified class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the unit currently holds a decoded tree
    pub fn is_tree(&self) -> bool {
        matches!(self.repr, Representation::Tree(_))
    }

    /// Whether any edits are queued
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a transformation marked the unit as skipped
    pub fn is_skipped(&self) -> bool {
        self.skipped_by.is_some()
    }

    /// Transformation that marked the unit as skipped
    pub fn skipped_by(&self) -> Option<&str> {
        self.skipped_by.as_deref()
    }

    /// Transformations that ran over the unit, in order
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Mark the unit so it is never defined
    ///
    /// The first transformation to skip is the one recorded.
    pub fn mark_skipped(&mut self) {
        if self.skipped_by.is_none() {
            self.skipped_by = Some(self.origin());
        }
    }

    /// Queue an edit over the decoded tree
    pub fn queue_tree_edit<F>(&mut self, edit: F)
    where
        F: FnOnce(&mut ClassFile) -> Result<(), TransformError> + Send + 'static,
    {
        let origin = self.origin();
        self.pending.push(Pending {
            origin,
            op: PendingOp::TreeEdit(Box::new(edit)),
        });
    }

    /// Queue a visitor to run over every element on the next decode
    pub fn queue_visitor_wrap<V>(&mut self, visitor: V)
    where
        V: ClassVisitor + Send + 'static,
    {
        let origin = self.origin();
        self.pending.push(Pending {
            origin,
            op: PendingOp::VisitorWrap(Box::new(visitor)),
        });
    }

    /// Replace the content with new raw bytes, dropping queued edits
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.pending.clear();
        self.repr = Representation::Raw(bytes);
    }

    /// Decoded tree with every queued edit applied
    pub fn as_tree(&mut self) -> Result<&mut ClassFile, CodeUnitError> {
        self.materialize()?;
        match &mut self.repr {
            Representation::Tree(tree) => Ok(&mut **tree),
            Representation::Raw(_) => unreachable!("unit was just materialized"),
        }
    }

    /// Current bytes, re-encoded when the unit holds a tree or has edits
    /// queued
    pub fn as_bytes(&mut self) -> Result<Cow<'_, [u8]>, CodeUnitError> {
        if self.has_pending() {
            self.materialize()?;
        }
        Ok(match &self.repr {
            Representation::Raw(bytes) => Cow::Borrowed(bytes.as_slice()),
            Representation::Tree(tree) => Cow::Owned(tree.encode()),
        })
    }

    /// Visit the current state without modifying it
    ///
    /// Untouched raw units are scanned straight from their bytes.
    pub fn walk(&mut self, visitor: &mut dyn ClassVisitor) -> Result<(), CodeUnitError> {
        if self.has_pending() {
            self.materialize()?;
        }
        match &self.repr {
            Representation::Raw(bytes) => ClassFile::scan(bytes, visitor)?,
            Representation::Tree(tree) => {
                tree.as_ref().clone().accept(&mut [visitor]);
            }
        }
        Ok(())
    }

    /// Produce the final bytes
    ///
    /// An untouched raw unit returns its original bytes. Anything else is
    /// materialized, has its frames recomputed through `resolver` and is
    /// re-encoded.
    pub fn finalize(mut self, resolver: &dyn SuperClassResolver) -> Result<Vec<u8>, CodeUnitError> {
        if self.pending.is_empty() {
            if let Representation::Raw(bytes) = self.repr {
                return Ok(bytes);
            }
        }
        let tree = self.as_tree()?;
        tree.compute_frames(resolver)?;
        Ok(tree.encode())
    }

    pub(crate) fn enter(&mut self, transformation: &str) {
        self.history.push(transformation.to_string());
        self.active = Some(transformation.to_string());
    }

    pub(crate) fn leave(&mut self) {
        self.active = None;
    }

    fn origin(&self) -> String {
        self.active.clone().unwrap_or_else(|| DIRECT.to_string())
    }

    fn materialize(&mut self) -> Result<(), CodeUnitError> {
        if self.pending.is_empty() && self.is_tree() {
            return Ok(());
        }

        let mut visitors = Vec::new();
        let mut edits = Vec::new();
        for pending in self.pending.drain(..) {
            match pending.op {
                PendingOp::VisitorWrap(visitor) => visitors.push(visitor),
                PendingOp::TreeEdit(edit) => edits.push((pending.origin, edit)),
            }
        }
        let mut chain: Vec<&mut dyn ClassVisitor> = visitors
            .iter_mut()
            .map(|v| v.as_mut() as &mut dyn ClassVisitor)
            .collect();

        let mut tree = match std::mem::replace(&mut self.repr, Representation::Raw(Vec::new())) {
            Representation::Raw(bytes) => match ClassFile::decode_with(&bytes, &mut chain) {
                Ok(tree) => tree,
                Err(e) => {
                    self.repr = Representation::Raw(bytes);
                    return Err(e.into());
                }
            },
            Representation::Tree(tree) if chain.is_empty() => *tree,
            Representation::Tree(tree) => tree.accept(&mut chain),
        };

        let result = edits.into_iter().try_for_each(|(origin, edit)| {
            edit(&mut tree).map_err(|source| CodeUnitError::Edit { origin, source })
        });
        self.repr = Representation::Tree(Box::new(tree));
        result
    }
}

impl std::fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("tree", &self.is_tree())
            .field("pending", &self.pending.len())
            .field("skipped_by", &self.skipped_by)
            .field("history", &self.history)
            .finish()
    }
}
