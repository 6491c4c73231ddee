use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame exceeds maximum size ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("unknown frame type byte: {0}")]
    UnknownFrameType(u8),

    #[error("malformed frame payload: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
