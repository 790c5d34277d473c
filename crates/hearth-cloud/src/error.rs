use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("no valid device registration record found")]
    NotRegistered,

    #[error("unexpected response from the cloud: {0}")]
    UnexpectedResponse(String),

    #[error("oauth error '{code}': {message}")]
    OAuth { code: String, message: String },

    #[error("cloud rejected the request: {code}: {message}")]
    Server { code: String, message: String },

    #[error("http transport failure: {0}")]
    Transport(String),
}

impl CloudError {
    pub fn has_server_code(&self, expected: &str) -> bool {
        matches!(self, CloudError::Server { code, .. } if code == expected)
    }
}
