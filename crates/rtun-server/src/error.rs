use thiserror::Error;

/// Errors fatal to the whole process: only bind/listen and TLS-material
/// load failures at startup qualify. Everything else is caught and
/// converted to a session closure or an HTTP status code.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS certificate/key: {0}")]
    TlsLoad(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("core error: {0}")]
    Core(#[from] rtun_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
