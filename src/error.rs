// src/error.rs

//! Error taxonomy for the presentation pipeline.
//!
//! Every failure falls into one of three classes: a missing kernel/driver
//! capability (reported at init), a resource failure at steady state
//! (allocation, buffer lock, commit submission), or a protocol violation
//! (the kernel rejecting a well-formed commit). None of them are retried.

use std::io;

use thiserror::Error;

use crate::kms::ObjectKind;

/// Crate-wide result alias.
pub type Result<T, E = PresentError> = std::result::Result<T, E>;

/// Coarse classification of a [`PresentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Capability,
    Resource,
    Protocol,
}

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("missing capability: {0}")]
    Capability(String),

    #[error("{op} failed: {cause:#}")]
    Resource { op: String, cause: anyhow::Error },

    #[error("{op} rejected by the kernel: {source}")]
    Protocol {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no {object} property: {name}")]
    UnknownProperty { object: ObjectKind, name: String },

    #[error("no usable surface backend")]
    NoUsableBackend,

    #[error("no buffer available: {0}")]
    NoBuffer(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl PresentError {
    pub fn capability(msg: impl Into<String>) -> Self {
        PresentError::Capability(msg.into())
    }

    /// Wraps an OS or collaborator failure, naming the operation that failed.
    pub fn resource(op: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        PresentError::Resource {
            op: op.into(),
            cause: cause.into(),
        }
    }

    /// Builds a `map_err` adapter for `op`.
    pub fn op<E: Into<anyhow::Error>>(op: &'static str) -> impl FnOnce(E) -> PresentError {
        move |cause| PresentError::resource(op, cause)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PresentError::Capability(_) | PresentError::NoUsableBackend => ErrorClass::Capability,
            PresentError::Protocol { .. } => ErrorClass::Protocol,
            PresentError::Resource { .. }
            | PresentError::UnknownProperty { .. }
            | PresentError::NoBuffer(_)
            | PresentError::Timeout(_) => ErrorClass::Resource,
        }
    }
}
