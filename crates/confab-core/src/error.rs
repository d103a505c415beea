use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),

    #[error("missing provider credentials: {0}")]
    MissingProvider(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
