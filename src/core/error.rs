//! Error types for the engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown tree id {0}")]
    UnknownTree(u32),

    #[error("range out of bounds: {0}")]
    OutOfRange(String),

    #[error("output buffer too small: need {needed}, have {have}")]
    InvalidBuffer { needed: usize, have: usize },

    #[error("non-finite view transform for instance {0}")]
    DegenerateProjection(usize),

    #[error("chunk decode failed for object {object} chunk {chunk}: {reason}")]
    ChunkDecodeFailed {
        object: u32,
        chunk: u32,
        reason: String,
    },

    #[error("paged objects exceed pool capacity ({objects} objects, {pages} pages)")]
    OverCapacity { objects: usize, pages: usize },

    #[error("engine disposed")]
    Disposed,

    #[error("container format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;
