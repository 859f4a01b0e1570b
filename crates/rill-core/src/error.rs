use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("validation error")]
    Validation,
    #[error("aggregation error")]
    Aggregation,
    #[error("sink error")]
    Sink,
    #[error("source error")]
    Source,
    #[error("data format error")]
    DataFormat,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Validation => 1001,
            Self::Aggregation => 1002,
            Self::Sink => 1003,
            Self::Source => 1004,
            Self::DataFormat => 1005,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
