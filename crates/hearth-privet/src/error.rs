use hearth_domain::DomainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivetError {
    #[error("too many pairing attempts, try again later")]
    DeviceBusy,

    #[error("pairing code or crypto implementation mismatch")]
    CommitmentMismatch,

    #[error("unknown session id '{0}'")]
    UnknownSession(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid authCode")]
    InvalidAuthCode,

    #[error("invalid authorization: {0}")]
    InvalidAuthorization(String),

    #[error("access token expired")]
    AuthorizationExpired,

    #[error("unsupported auth mode")]
    InvalidAuthMode,

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("access denied")]
    AccessDenied,

    #[error("unknown endpoint")]
    NotFound,

    #[error("setup is unavailable on this device")]
    SetupUnavailable,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl PrivetError {
    /// Wire code placed in the `error.code` field of a Privet reply.
    pub fn code(&self) -> &str {
        match self {
            PrivetError::DeviceBusy => "deviceBusy",
            PrivetError::CommitmentMismatch => "commitmentMismatch",
            PrivetError::UnknownSession(_) => "unknownSession",
            PrivetError::InvalidFormat(_) => "invalidFormat",
            PrivetError::InvalidAuthCode => "invalidAuthCode",
            PrivetError::InvalidAuthorization(_) => "invalidAuthorization",
            PrivetError::AuthorizationExpired => "authorizationExpired",
            PrivetError::InvalidAuthMode => "invalidAuthMode",
            PrivetError::InvalidParams(_) => "invalidParams",
            PrivetError::AccessDenied => "accessDenied",
            PrivetError::NotFound => "notFound",
            PrivetError::SetupUnavailable => "setupUnavailable",
            PrivetError::Domain(e) => e.code(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            PrivetError::DeviceBusy => 503,
            PrivetError::CommitmentMismatch
            | PrivetError::InvalidAuthCode
            | PrivetError::InvalidAuthorization(_)
            | PrivetError::AuthorizationExpired => 401,
            PrivetError::AccessDenied => 403,
            PrivetError::NotFound => 404,
            PrivetError::Domain(DomainError::AccessDenied { .. }) => 403,
            _ => 400,
        }
    }
}
