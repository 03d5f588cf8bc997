//! The process-wide outbound HTTP transport used by the forwarder.

use crate::config::TransportSettings;
use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bounds the connect phase of the wrapped connector, TLS handshake included.
#[derive(Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for HandshakeTimeout<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect/TLS handshake exceeded {:?}", timeout),
                )) as BoxError),
            }
        })
    }
}

type Connector = HandshakeTimeout<HttpsConnector<HttpConnector>>;

/// Shared, read-only connection manager for plain HTTP forwarding.
///
/// Built once at startup and cloned into every connection task; clones share
/// one idle pool. No upstream proxy is ever consulted and requests are never
/// retried.
#[derive(Clone)]
pub struct SharedTransport {
    client: Client<Connector, ProxyBody>,
    settings: TransportSettings,
}

impl SharedTransport {
    pub fn new(settings: TransportSettings) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(settings.connect_timeout));

        let connector = HandshakeTimeout::new(
            HttpsConnector::new_with_connector(http),
            settings.tls_handshake_timeout,
        );

        // hyper bounds idle connections per host; the cap is applied there.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.pool_max_idle)
            .pool_idle_timeout(settings.idle_timeout)
            .pool_timer(TokioTimer::new())
            .retry_canceled_requests(false)
            .build(connector);

        Self { client, settings }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Performs a single round trip. Transport failures map to `ProxyError::Upstream`.
    pub async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        self.client
            .request(req)
            .await
            .map_err(|e| ProxyError::Upstream(error_chain(&e)))
    }
}

impl Default for SharedTransport {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

// hyper-util's client error hides the useful part (DNS, refused, timeout) in its source chain
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use std::convert::Infallible;

    #[derive(Clone)]
    struct NeverConnects;

    impl Service<Uri> for NeverConnects {
        type Response = ();
        type Error = Infallible;
        type Future = futures::future::Pending<Result<(), Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _uri: Uri) -> Self::Future {
            futures::future::pending()
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_fires() {
        let mut connector = HandshakeTimeout::new(NeverConnects, Duration::from_millis(20));
        let err = connector
            .call(Uri::from_static("https://example.com"))
            .await
            .unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_upstream_error() {
        // Bind then drop so the port is closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = SharedTransport::default();
        let body: ProxyBody = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(body)
            .unwrap();

        let err = transport.execute(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)), "got {:?}", err);
    }

    #[test]
    fn test_clones_share_settings() {
        let transport = SharedTransport::default();
        let clone = transport.clone();
        assert_eq!(clone.settings().pool_max_idle, 100);
        assert_eq!(clone.settings().idle_timeout, Duration::from_secs(90));
    }
}
