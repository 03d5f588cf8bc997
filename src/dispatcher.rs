//! Per-request routing between the tunnel establisher and the HTTP forwarder.

use crate::error::ProxyError;
use crate::forward::HttpForwarder;
use crate::response::ResponseBuilder;
use crate::transport::{ProxyBody, SharedTransport};
use crate::tunnel::{NoTakeover, TunnelEstablisher};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Body;
use hyper::{Request, Response};
use log::{debug, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel,
    Forward,
}

/// Picks the handler for a request from its method alone.
pub fn classify(method: &str) -> Route {
    if method.eq_ignore_ascii_case("CONNECT") {
        Route::Tunnel
    } else {
        Route::Forward
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    forwarder: Arc<HttpForwarder>,
    tunnels: TunnelEstablisher,
}

impl Dispatcher {
    pub fn new(transport: SharedTransport, tunnels: TunnelEstablisher) -> Self {
        Self {
            forwarder: Arc::new(HttpForwarder::new(transport)),
            tunnels,
        }
    }

    pub fn tunnels(&self) -> &TunnelEstablisher {
        &self.tunnels
    }

    /// Service entry point for requests read by the HTTP server.
    ///
    /// Failures become plain-text responses, except cancellation: the client
    /// is gone, so the error goes back to hyper and no response is written.
    pub async fn handle<B>(&self, req: Request<B>, cancel: CancellationToken) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let method = req.method().clone();
        let target = req.uri().clone();

        match self.route(req, &cancel).await {
            Ok(response) => Ok(response),
            Err(ProxyError::Cancelled) => {
                debug!("{} {} cancelled by client", method, target);
                Err(ProxyError::Cancelled)
            }
            Err(e) => {
                warn!("Proxy error for {} {}: {}", method, target, e);
                Ok(ResponseBuilder::from_error(&e))
            }
        }
    }

    async fn route<B>(&self, req: Request<B>, cancel: &CancellationToken) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        match classify(req.method().as_str()) {
            Route::Tunnel => {
                // The HTTP server keeps this socket, so takeover fails before any raw write.
                let target = req.uri().to_string();
                self.tunnels.establish(&target, NoTakeover).await?;
                Ok(Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()))
            }
            Route::Forward => self.forwarder.forward(req, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeardownPolicy;
    use hyper::{Method, StatusCode};
    use std::time::Duration;

    #[test]
    fn test_connect_matches_case_insensitively() {
        assert_eq!(classify("CONNECT"), Route::Tunnel);
        assert_eq!(classify("connect"), Route::Tunnel);
        assert_eq!(classify("Connect"), Route::Tunnel);
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            SharedTransport::default(),
            TunnelEstablisher::new(Duration::from_secs(1), TeardownPolicy::FirstFinisher),
        )
    }

    fn request(method: Method, uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cancelled_forward_yields_no_response() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher()
            .handle(request(Method::GET, "http://127.0.0.1:9/"), cancel)
            .await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_failures_become_responses() {
        let bad_target = dispatcher()
            .handle(request(Method::GET, "/relative"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bad_target.status(), StatusCode::BAD_REQUEST);

        let connect = dispatcher()
            .handle(request(Method::CONNECT, "example.org:443"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connect.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_everything_else_is_forwarded() {
        for method in ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH", "CONNECTX", "HEAD"] {
            assert_eq!(classify(method), Route::Forward, "{}", method);
        }
    }
}
