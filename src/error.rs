// This module defines the error types for the annotation tooling using the thiserror crate.
// AnnotationError covers every failure outside the zero-overhead site path itself (which has
// no runtime error path at all): unsupported pointer widths or object architectures, a skip
// whose displacement does not span the dead label reference (the one defect that breaks
// native execution silently), malformed candidate sites, iced-x86 encoding failures and
// object-file read/write errors. AnnotationResult<T> is the matching Result alias used by the
// scanner, the site assembler and the ELF emitter/reader.

//! Error types for annotation emission and verification.

use thiserror::Error;

/// Main error type for annotation tooling.
#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("Unsupported {bits}-bit target for annotation sites")]
    UnsupportedWidth { bits: u32 },

    #[error("Unsupported object architecture: {architecture:?}")]
    UnsupportedArchitecture { architecture: object::Architecture },

    #[error(
        "Skip at offset {offset:#x} jumps {declared} bytes but the label reference spans {actual}"
    )]
    SkipMismatch {
        offset: usize,
        declared: u8,
        actual: usize,
    },

    #[error("Malformed annotation site at offset {offset:#x}: {reason}")]
    MalformedSite { offset: usize, reason: String },

    #[error("Encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Object file error: {0}")]
    Object(#[from] object::Error),

    #[error("Object write error: {0}")]
    ObjectWrite(#[from] object::write::Error),
}

impl AnnotationError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        AnnotationError::MalformedSite {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        AnnotationError::Encoding {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for annotation operations.
pub type AnnotationResult<T> = Result<T, AnnotationError>;
