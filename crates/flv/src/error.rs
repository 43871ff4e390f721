use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlvError {
    #[error("invalid FLV header: {0}")]
    InvalidHeader(String),

    #[error("tag of {size} bytes exceeds the {limit} byte limit")]
    TagTooLarge { size: usize, limit: usize },
}
