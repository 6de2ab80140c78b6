use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::ids::NodeKind;

/// The error type shared by every forest operation.
///
/// Errors returned from mutation paths are also appended to the forest's
/// issue list; comparing an aggregated error against the original one uses
/// [`MptError::eq`], which matches I/O payloads by identity rather than by
/// message so injected backend failures stay recognizable.
#[derive(Debug, Error, Clone)]
pub enum MptError {
    #[error("storage error: {0}")]
    Storage(#[from] Arc<io::Error>),
    #[error("corrupted node encoding: {0}")]
    Corrupted(String),
    #[error("incompatible metadata: {0}")]
    IncompatibleMetadata(String),
    #[error("operation expects {expected} node, found {found} node")]
    UnexpectedNode {
        expected: &'static str,
        found: NodeKind,
    },
    #[error("consistency violation: {0}")]
    Consistency(String),
    #[error("operation canceled")]
    Canceled,
    #[error("directory already locked: {}", .0.display())]
    Locked(PathBuf),
    #[error("worker shutdown failure: {0}")]
    Shutdown(String),
    #[error("{}", display_joined(.0))]
    Multiple(Vec<MptError>),
}

impl MptError {
    pub fn from_io(err: io::Error) -> Self {
        MptError::Storage(Arc::new(err))
    }

    /// Joins a list of errors into a single one, flattening nested joins.
    /// Returns `None` when the list is empty.
    pub fn join(errors: Vec<MptError>) -> Option<MptError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                MptError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(MptError::Multiple(flat)),
        }
    }

    /// Reports whether `target` occurs in `self`, descending into joins.
    pub fn contains(&self, target: &MptError) -> bool {
        if self == target {
            return true;
        }
        match self {
            MptError::Multiple(inner) => inner.iter().any(|e| e.contains(target)),
            _ => false,
        }
    }
}

impl PartialEq for MptError {
    fn eq(&self, other: &Self) -> bool {
        use MptError::*;
        match (self, other) {
            (Storage(a), Storage(b)) => Arc::ptr_eq(a, b),
            (Corrupted(a), Corrupted(b)) => a == b,
            (IncompatibleMetadata(a), IncompatibleMetadata(b)) => a == b,
            (
                UnexpectedNode {
                    expected: ea,
                    found: fa,
                },
                UnexpectedNode {
                    expected: eb,
                    found: fb,
                },
            ) => ea == eb && fa == fb,
            (Consistency(a), Consistency(b)) => a == b,
            (Canceled, Canceled) => true,
            (Locked(a), Locked(b)) => a == b,
            (Shutdown(a), Shutdown(b)) => a == b,
            (Multiple(a), Multiple(b)) => a == b,
            _ => false,
        }
    }
}

fn display_joined(errors: &[MptError]) -> String {
    let mut out = String::new();
    for (i, err) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&err.to_string());
    }
    out
}
