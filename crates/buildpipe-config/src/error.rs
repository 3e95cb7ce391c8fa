//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("INI parse error: {0}")]
    Parse(String),

    #[error("malformed list value for '{key}' in group '{group}': {message}")]
    MalformedList {
        group: String,
        key: String,
        message: String,
    },

    #[error("duplicate configuration id: {0}")]
    Duplicate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
