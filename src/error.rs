//! Error taxonomy for the vmtree engine.
//!
//! Every public operation returns a `Result<T, VmtreeError>` rather than the
//! bare `-1`/`NULL` sentinels of the original C source; internal helpers
//! that mirror the source's `-1` convention instead return `Option<T>` and
//! are converted at the point where the caller decides whether to recover
//! or propagate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmtreeError {
    #[error("block device I/O failed: {0}")]
    Io(String),

    #[error("storage is at capacity, no reclaimable block can free {needed} pages")]
    OutOfSpace { needed: u16 },

    #[error("mapping table is full and a root-wards cascade could not relieve it")]
    OutOfMappingSpace,

    #[error("key not found")]
    NotFound,

    #[error("tree invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, VmtreeError>;
