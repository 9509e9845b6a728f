//! Audit mode
//!
//! Runs every class of the game through the same path live loading uses and
//! writes the results to an archive instead of defining them.

use crate::content::ContentSource;
use crate::loader::{ProcessOutcome, TransformingLoader};
use anvil_bytecode::class_name_of_entry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Audit output could not be written
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to read content or write the archive file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to write an archive entry
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// What happened to one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// A class was processed and written
    Written {
        /// Whether the written bytes differ from the input
        modified: bool,
        /// SHA-256 of the written bytes, hex encoded
        digest: String,
    },
    /// A non-class entry was copied as-is
    Copied {
        /// SHA-256 of the copied bytes, hex encoded
        digest: String,
    },
    /// A transformation skipped the class; nothing was written
    Skipped {
        /// Name of the skipping transformation
        by: String,
    },
    /// Processing failed; nothing was written
    Failed {
        /// Error message
        message: String,
    },
}

/// Audit result of one archive entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Archive entry name
    pub entry: String,
    /// Outcome
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

/// Per-entry outcomes of an audit run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Output archive
    pub output: PathBuf,
    /// Entries in walk order
    pub entries: Vec<AuditEntry>,
}

impl AuditReport {
    /// Number of classes written
    pub fn written(&self) -> usize {
        self.count(|o| matches!(o, AuditOutcome::Written { .. }))
    }

    /// Number of classes whose bytes changed
    pub fn modified(&self) -> usize {
        self.count(|o| matches!(o, AuditOutcome::Written { modified: true, .. }))
    }

    /// Number of entries copied unchanged
    pub fn copied(&self) -> usize {
        self.count(|o| matches!(o, AuditOutcome::Copied { .. }))
    }

    /// Number of classes skipped
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, AuditOutcome::Skipped { .. }))
    }

    /// Number of classes that failed
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, AuditOutcome::Failed { .. }))
    }

    /// Outcome recorded for `entry`
    pub fn get(&self, entry: &str) -> Option<&AuditOutcome> {
        self.entries
            .iter()
            .find(|e| e.entry == entry)
            .map(|e| &e.outcome)
    }

    /// Pretty-printed JSON form of the report
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn count(&self, pred: impl Fn(&AuditOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

/// Process every entry of `game` and write the results to `output`
///
/// Class entries are read through the loader's layered content, so a mod
/// overriding a game class is audited with its own bytes. Failures are
/// recorded per entry and do not stop the walk.
///
/// # Arguments
///
/// * `loader` - Loader whose pipeline and oracle process the classes
/// * `game` - Content whose entries are walked
/// * `output` - Archive to create
pub fn audit(
    loader: &TransformingLoader,
    game: &dyn ContentSource,
    output: &Path,
) -> Result<AuditReport, AuditError> {
    let names = game.entries()?;
    info!(entries = names.len(), output = %output.display(), "starting audit");

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());
    let mut writer = ZipWriter::new(File::create(output)?);
    let mut entries = Vec::with_capacity(names.len());

    for entry in names {
        let outcome = match class_name_of_entry(&entry) {
            Some(class) => match audit_class(loader, game, &class, &entry) {
                Ok(Some((bytes, modified))) => {
                    writer.start_file(entry.as_str(), options)?;
                    writer.write_all(&bytes)?;
                    AuditOutcome::Written {
                        modified,
                        digest: digest(&bytes),
                    }
                }
                Ok(None) => continue,
                Err(outcome) => outcome,
            },
            None => match game.read(&entry) {
                Ok(Some(bytes)) => {
                    writer.start_file(entry.as_str(), options)?;
                    writer.write_all(&bytes)?;
                    AuditOutcome::Copied {
                        digest: digest(&bytes),
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("reading {} for audit failed: {}", entry, e);
                    AuditOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            },
        };
        debug!("audited {}: {:?}", entry, outcome);
        entries.push(AuditEntry { entry, outcome });
    }
    writer.finish()?;

    let report = AuditReport {
        output: output.to_path_buf(),
        entries,
    };
    info!(
        written = report.written(),
        modified = report.modified(),
        copied = report.copied(),
        skipped = report.skipped(),
        failed = report.failed(),
        "audit complete"
    );
    Ok(report)
}

/// Returns the bytes to write and whether they changed, or the outcome to
/// record when nothing is written. `Ok(None)` means the entry vanished.
fn audit_class(
    loader: &TransformingLoader,
    game: &dyn ContentSource,
    class: &str,
    entry: &str,
) -> Result<Option<(Vec<u8>, bool)>, AuditOutcome> {
    let failed = |message: String| AuditOutcome::Failed { message };

    let fetched = match loader.fetch(class).map_err(|e| failed(e.to_string()))? {
        Some(bytes) => Some(bytes),
        None => game.read(entry).map_err(|e| failed(e.to_string()))?,
    };
    let Some(original) = fetched else {
        return Ok(None);
    };

    match loader.process(class, original.clone()) {
        Ok(ProcessOutcome::Finalized(processed)) => {
            let modified = processed.bytes != original;
            Ok(Some((processed.bytes, modified)))
        }
        Ok(ProcessOutcome::Skipped { by }) => Err(AuditOutcome::Skipped { by }),
        Err(e) => {
            warn!("audit of {} failed: {}", class, e);
            Err(failed(e.to_string()))
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
