//! Error taxonomy for the revision and changeset layer.

use crate::DocId;
use std::io;
use thiserror::Error;

/// Errors raised by glassdb storage operations.
#[derive(Debug, Error)]
pub enum GlassError {
    /// A persisted record is corrupt or short. Fatal to the read or open
    /// operation which found it; never patched up silently.
    #[error("corrupt {what}: {detail}")]
    Format { what: &'static str, detail: String },

    /// A caller broke a protocol or counter invariant (for example committing
    /// a revision out of sequence). Aborts the operation without touching
    /// durable state.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// An underlying read, write, sync, or rename failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested document has no termlist.
    #[error("document {0} not found")]
    DocumentNotFound(DocId),
}

impl GlassError {
    pub(crate) fn format(what: &'static str, detail: impl Into<String>) -> Self {
        GlassError::Format {
            what,
            detail: detail.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GlassError>;
