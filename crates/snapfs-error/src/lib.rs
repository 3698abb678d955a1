#![forbid(unsafe_code)]
//! Error handling for the snapfs workspace.
//!
//! One enum covers every failure the engine can surface to a host:
//!
//! | Variant            | Meaning                                            |
//! |--------------------|----------------------------------------------------|
//! | `Io`               | Device read/write/sync failure                     |
//! | `NoSpace`          | Allocation failed; volume or reserve exhausted     |
//! | `PermissionDenied` | Disallowed write, e.g. into an on-chain snapshot   |
//! | `Inconsistency`    | Repaired-forward invariant violation               |
//! | `Corruption`       | On-disk structure failed validation                |
//! | `Format`           | Structural misuse (bad geometry, bad arguments)    |
//! | `NotFound`         | No such snapshot/inode                             |
//! | `InvalidState`     | Lifecycle policy rejection                         |
//! | `ReadOnly`         | Mutation attempted on a read-only volume           |
//!
//! `Inconsistency` deserves a note: the engine fixes such violations
//! forward and marks the volume for an offline check, so the variant is
//! mostly seen in logs and status reports rather than as a hard failure.

use snapfs_types::ParseError;
use thiserror::Error;

/// Any failure surfaced by a snapfs crate.
#[derive(Debug, Error)]
pub enum SnapError {
    /// Underlying device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Block allocation failed.
    #[error("no space left on volume")]
    NoSpace,

    /// The operation is not permitted on this inode.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An invariant violation was detected and repaired forward.
    #[error("inconsistency: {detail}")]
    Inconsistency { detail: String },

    /// An on-disk structure failed validation.
    #[error("corruption at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Caller misuse: bad geometry, zero-length request, out-of-range id.
    #[error("format error: {0}")]
    Format(String),

    /// No snapshot or inode with the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lifecycle precondition does not hold.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The volume was loaded read-only.
    #[error("volume is read-only")]
    ReadOnly,
}

impl From<ParseError> for SnapError {
    fn from(e: ParseError) -> Self {
        SnapError::Corruption {
            block: 0,
            detail: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(SnapError::NoSpace.to_string(), "no space left on volume");
        assert_eq!(
            SnapError::Corruption {
                block: 42,
                detail: "bad record".into()
            }
            .to_string(),
            "corruption at block 42: bad record"
        );
        assert_eq!(
            SnapError::PermissionDenied("write to inode 7".into()).to_string(),
            "permission denied: write to inode 7"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: SnapError = io.into();
        assert!(matches!(err, SnapError::Io(_)));
    }

    #[test]
    fn parse_errors_become_corruption() {
        let err: SnapError = ParseError::Invalid("zero generation".into()).into();
        assert!(matches!(err, SnapError::Corruption { .. }));
    }
}
