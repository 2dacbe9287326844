//! Construction-time error reporting.
//!
//! Everything past `create` stays `Option`-shaped per the algorithm's
//! contract (OOM, missing key and duplicate-key are all callers'
//! responsibility to distinguish via the returned value, not via `Result`).
//! `create` is the one place worth a named error: misconfiguration here is
//! a setup mistake the embedder wants logged with a reason, not a bare
//! `None`.

use std::fmt;

/// Reasons [`crate::ThMap::create`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CreateError {
    /// `base` did not have its low two bits clear.
    MisalignedBase,
    /// The root node allocation failed.
    OutOfMemory,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::MisalignedBase => {
                write!(f, "base address is not aligned to 4 bytes")
            }
            CreateError::OutOfMemory => write!(f, "allocator failed to provide the root node"),
        }
    }
}

impl std::error::Error for CreateError {}
