use thiserror::Error;

// Unified error type for multifront

#[derive(Error, Debug)]
pub enum MfError {
    #[error("malformed elimination tree at separator [{begin}, {end}): {reason}")]
    MalformedTree {
        begin: usize,
        end: usize,
        reason: String,
    },
    #[error("process count {found} inconsistent with communicator size {expected}")]
    ProcessCount { expected: usize, found: usize },
    #[error("communication error: {0}")]
    Comm(String),
    #[error("zero pivot at row {0}")]
    ZeroPivot(usize),
    #[error("singular separator block in front [{begin}, {end}) at pivot {pivot}")]
    Singular {
        begin: usize,
        end: usize,
        pivot: usize,
    },
    #[error("front tree has not been factored")]
    NotFactored,
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("invalid sparse matrix: {0}")]
    InvalidMatrix(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
