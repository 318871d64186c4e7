use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("sip stack error: {0}")]
    SipStack(String),

    #[error("media channel error: {0}")]
    Media(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed value: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal fault: {0}")]
    Internal(String),
}

impl Error {
    pub fn sip_stack<E: std::fmt::Display>(err: E) -> Self {
        Self::SipStack(err.to_string())
    }

    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn media<E: std::fmt::Display>(err: E) -> Self {
        Self::Media(err.to_string())
    }

    pub fn invalid_argument<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidArgument(err.to_string())
    }

    pub fn parse<E: std::fmt::Display>(err: E) -> Self {
        Self::Parse(err.to_string())
    }

    pub fn not_found<E: std::fmt::Display>(err: E) -> Self {
        Self::NotFound(err.to_string())
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }
}
