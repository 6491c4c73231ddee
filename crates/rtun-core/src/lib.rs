pub mod backoff;
pub mod config;
pub mod error;
pub mod frame;
pub mod headers;

pub use error::{CoreError, Result};
