use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad target: {0}")]
    BadTarget(String),

    #[error("Failed to build outbound request: {0}")]
    Construction(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Raw socket takeover is not supported on this connection")]
    NotSupported,

    #[error("Failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("Request cancelled by client")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Hyper error: {0}")]
    Hyper(String),
}

impl ProxyError {
    /// Status reported to the client when the error surfaces on the HTTP response path.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadTarget(_) | ProxyError::Url(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) | ProxyError::Dial { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(e: hyper::Error) -> Self {
        ProxyError::Hyper(e.to_string())
    }
}
