//! Error type shared by configuration, validation and buffer binding.

use thiserror::Error;

use crate::types::DataType;

#[derive(Debug, Error)]
pub enum GemmError {
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("no kernel supports the requested problem")]
    NoKernel,
    #[error("data type mismatch: expected {expected:?}, found {found:?}")]
    DataTypeMismatch { expected: DataType, found: DataType },
    #[error("{what} buffer too small: need {needed}, got {got}")]
    BufferTooSmall { what: &'static str, needed: usize, got: usize },
    #[error("misaligned buffer: {0}")]
    Misaligned(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

pub type GemmResult<T> = Result<T, GemmError>;

impl From<rayon::ThreadPoolBuildError> for GemmError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        GemmError::ThreadPool(err.to_string())
    }
}

impl From<bytemuck::PodCastError> for GemmError {
    fn from(err: bytemuck::PodCastError) -> Self {
        match err {
            bytemuck::PodCastError::TargetAlignmentGreaterAndInputNotAligned => {
                GemmError::Misaligned("buffer not aligned for target element type")
            }
            other => GemmError::InvalidArgument(format!("byte cast failed: {other:?}")),
        }
    }
}
