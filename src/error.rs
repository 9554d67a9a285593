use thiserror::Error;

#[derive(Debug, Error)]
pub enum FheCnnError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("capacity exceeded: need {needed} slots, only {available} available")]
    CapacityExceeded { needed: usize, available: usize },

    #[error("rotation key for shift {0} not in key table")]
    MissingRotationKey(usize),

    #[error("key not available: {0}")]
    MissingKey(String),

    #[error("level exhausted: multiply attempted at level {level}")]
    LevelExhausted { level: u32 },

    #[error("insufficient depth: stage needs {needed} levels, ciphertext has {available}")]
    InsufficientDepth { needed: u32, available: u32 },

    #[error("level mismatch: {left} vs {right}")]
    LevelMismatch { left: u32, right: u32 },

    #[error("scale mismatch between operands")]
    ScaleMismatch,

    #[error("ciphertext must be relinearized first")]
    NotRelinearized,

    #[error("key does not belong to this ciphertext")]
    KeyMismatch,

    #[error("bootstrapper used before warmup")]
    BootstrapNotReady,

    #[error("bootstrap did not raise level: {before} -> {after}")]
    BootstrapIneffective { before: u32, after: u32 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FheCnnError>;
