//! Loader error type

use crate::adapter::AdapterError;
use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::hierarchy::HierarchyError;
use crate::host::DefineError;
use crate::unit::TransformError;
use anvil_bytecode::{ClassFileError, FrameError};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while resolving, transforming or defining classes
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Content could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An entrypoint could not be instantiated
    #[error("Language adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Audit mode failed to write its output
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// The class bytes could not be decoded
    #[error("Corrupt artifact {class}: {source}")]
    CorruptArtifact {
        /// Class being loaded
        class: String,
        /// Decoder failure
        source: ClassFileError,
    },

    /// A transformation failed
    #[error("Transformation {transform} failed on {class}: {source}")]
    Transform {
        /// Class being loaded
        class: String,
        /// Name of the failing transformation
        transform: String,
        /// Transformation failure
        source: TransformError,
    },

    /// The type hierarchy is inconsistent
    #[error("Hierarchy integrity error while finalizing {class}: {source}")]
    Hierarchy {
        /// Class being finalized
        class: String,
        /// Structural failure
        source: HierarchyError,
    },

    /// Frames could not be recomputed
    #[error("Failed to finalize {class}: {source}")]
    Finalize {
        /// Class being finalized
        class: String,
        /// Frame computation failure
        source: FrameError,
    },

    /// The host rejected the final bytes
    #[error("Failed to define {class} (transformations: [{}]): {reason}", history.join(", "))]
    Define {
        /// Class being defined
        class: String,
        /// Transformations that ran over the class, in order
        history: Vec<String>,
        /// Host failure
        #[source]
        reason: DefineError,
    },

    /// A stored resolution failure observed again
    #[error("Failed to resolve {class}: {source}")]
    Resolve {
        /// Requested class
        class: String,
        /// First caller's failure
        source: Arc<LoaderError>,
    },

    /// The game's main class does not exist
    #[error("Main class not found: {0}")]
    MainClassNotFound(String),

    /// A transformation skipped the game's main class
    #[error("Main class {class} was skipped by {by}")]
    MainClassSkipped {
        /// Main class
        class: String,
        /// Skipping transformation
        by: String,
    },
}
