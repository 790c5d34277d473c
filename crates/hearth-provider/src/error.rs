use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("network is offline")]
    Offline,

    #[error("operation timed out")]
    Timeout,

    #[error("{0} is not supported by this provider")]
    NotSupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
