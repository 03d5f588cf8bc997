use crate::error::ProxyError;
use crate::transport::ProxyBody;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

/// Short plain-text responses the proxy produces itself.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let body = Full::new(Bytes::from(message.to_string()))
            .map_err(|never| match never {})
            .boxed_unsync();
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }

    /// Maps a proxy failure onto its client-visible status.
    pub fn from_error(error: &ProxyError) -> Response<ProxyBody> {
        let status = error.status_code();
        let message = match error {
            ProxyError::BadTarget(_) | ProxyError::Url(_) => format!("Bad Request: {}", error),
            ProxyError::Upstream(_) => "Bad Gateway".to_string(),
            _ => format!("Proxy Error: {}", error),
        };
        Self::error(status, &message)
    }
}
