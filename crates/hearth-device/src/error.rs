use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Domain(#[from] hearth_domain::DomainError),

    #[error(transparent)]
    Config(#[from] hearth_config::ConfigError),
}
