use crate::core::tensor::Op;
use crate::optim::LinesearchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("arena out of memory: needed {needed} bytes, {available} available")]
    OutOfArena { needed: usize, available: usize },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("backward pass is not implemented for {0:?}")]
    UnsupportedBackward(Op),

    #[error("all context slots are in use")]
    NoFreeContext,

    #[error("graph capacity exceeded ({0} nodes)")]
    GraphCapacity(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("wolfe parameter must lie in (ftol, 1)")]
    InvalidWolfe,

    #[error("line search failed: {0:?}")]
    Linesearch(LinesearchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
