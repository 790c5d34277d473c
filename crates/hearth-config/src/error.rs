use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stored settings are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for setting '{name}': {message}")]
    InvalidValue { name: String, message: String },

    #[error("config store failure: {0}")]
    Store(String),
}
