use thiserror::Error;

/// Errors surfaced by the segmentation engine.
///
/// The merge engine itself never fails on bad data: heap anomalies are repaired in place and
/// the one broken invariant it can detect (an empty best-candidate set) aborts the job. What
/// remains are configuration problems, collaborator failures and wire/transport faults.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("indices ({col}, {row}, {slice}) out of bounds")]
    IndicesOutOfBounds { col: usize, row: usize, slice: usize },

    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),

    #[error("dimension mismatch: expected {expected} elements, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message tag {0}")]
    UnknownMessage(u8),

    #[error("unsupported message schema version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected message: expected {expected}, got {found}")]
    UnexpectedMessage {
        expected: &'static str,
        found: &'static str,
    },

    #[error("task {0} disconnected")]
    Disconnected(u32),

    #[error("failed to spawn task {id}: {reason}")]
    Spawn { id: u32, reason: String },

    #[error("task {id} failed: {message}")]
    TaskFailed { id: u32, message: String },

    #[error("raster error: {0}")]
    Raster(String),
}
