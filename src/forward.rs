//! Plain HTTP forwarding of absolute-form requests.

use crate::error::ProxyError;
use crate::headers::strip_hop_by_hop;
use crate::transport::{ProxyBody, SharedTransport};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HOST, HeaderValue};
use hyper::{Request, Response, Uri};
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use url::Url;

pub struct HttpForwarder {
    transport: SharedTransport,
}

impl HttpForwarder {
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    /// Forwards `req` to the origin named by its absolute-form target.
    ///
    /// The upstream body is streamed back as-is; it is released when the
    /// returned response body is dropped, whether or not it was read to the end.
    /// Cancelling `cancel` abandons the in-flight round trip.
    pub async fn forward<B>(&self, req: Request<B>, cancel: &CancellationToken) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
    {
        let outbound = build_outbound(req)?;
        let method = outbound.method().clone();
        let target = outbound.uri().clone();
        info!("HTTP request {} {}", method, target);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Client went away, abandoning {} {}", method, target);
                return Err(ProxyError::Cancelled);
            }
            result = self.transport.execute(outbound) => result?,
        };

        info!("Successfully forwarded {} {} - Status: {}", method, target, response.status());
        Ok(response.map(|body| body.boxed_unsync()))
    }
}

/// Resolves an inbound request target into the absolute URL to fetch.
/// Scheme and host are both required.
pub fn parse_target(target: &str) -> Result<Uri, ProxyError> {
    let url = Url::parse(target).map_err(|e| ProxyError::BadTarget(format!("{:?}: {}", target, e)))?;
    if url.scheme().is_empty() {
        return Err(ProxyError::BadTarget(format!("{:?} has no scheme", target)));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(ProxyError::BadTarget(format!("{:?} has no host", target))),
    }
    url.as_str()
        .parse::<Uri>()
        .map_err(|e| ProxyError::BadTarget(format!("{:?}: {}", target, e)))
}

/// Rewrites an inbound proxy request into the request sent upstream:
/// same method and body, absolute target, hop-by-hop headers removed and
/// `Host` set from the target authority.
pub fn build_outbound<B>(req: Request<B>) -> Result<Request<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
{
    let target = parse_target(&req.uri().to_string())?;
    // Host always names the target authority, whatever the client sent.
    let host = target
        .authority()
        .map(|authority| HeaderValue::from_str(authority.as_str()))
        .transpose()
        .map_err(|e| ProxyError::Construction(e.to_string()))?;
    let (parts, body) = req.into_parts();

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(target)
        .body(body.boxed_unsync())
        .map_err(|e| ProxyError::Construction(e.to_string()))?;
    let mut headers = strip_hop_by_hop(&parts.headers);
    headers.remove(HOST);
    if let Some(host) = host {
        headers.insert(HOST, host);
    }
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::Method;
    use hyper::header::{ACCEPT, CONNECTION};
    use std::time::Duration;

    fn request(method: Method, uri: &str) -> Request<ProxyBody> {
        let body = Full::new(Bytes::from_static(b"payload"))
            .map_err(|never| match never {})
            .boxed_unsync();
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "example.com")
            .header(ACCEPT, "text/plain")
            .header(CONNECTION, "keep-alive")
            .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .body(body)
            .unwrap()
    }

    #[test]
    fn test_parse_target_accepts_absolute_urls() {
        let uri = parse_target("http://example.com/foo?x=1").unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.host(), Some("example.com"));
        assert_eq!(uri.path_and_query().unwrap().as_str(), "/foo?x=1");

        let uri = parse_target("https://example.com:8443/").unwrap();
        assert_eq!(uri.port_u16(), Some(8443));
    }

    #[test]
    fn test_parse_target_rejects_incomplete_urls() {
        for target in ["not a url", "/foo", "mailto:someone@example.com", "example.com:80", ""] {
            let result = parse_target(target);
            assert!(matches!(result, Err(ProxyError::BadTarget(_))), "{:?} -> {:?}", target, result);
        }
    }

    #[tokio::test]
    async fn test_build_outbound_strips_hop_by_hop_only() {
        let outbound = build_outbound(request(Method::POST, "http://example.com/foo?x=1")).unwrap();

        assert_eq!(outbound.method(), Method::POST);
        assert_eq!(outbound.uri(), "http://example.com/foo?x=1");
        assert_eq!(outbound.headers()[ACCEPT], "text/plain");
        assert_eq!(outbound.headers()[HOST], "example.com");
        assert_eq!(outbound.headers().get_all(HOST).iter().count(), 1);
        assert!(outbound.headers().get(CONNECTION).is_none());
        assert!(outbound.headers().get("proxy-authorization").is_none());

        let body = outbound.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_build_outbound_replaces_client_host() {
        let mut req = request(Method::GET, "http://127.0.0.1:8080/x");
        req.headers_mut().insert(HOST, HeaderValue::from_static("evil.example"));

        let outbound = build_outbound(req).unwrap();
        assert_eq!(outbound.headers()[HOST], "127.0.0.1:8080");
        assert_eq!(outbound.headers().get_all(HOST).iter().count(), 1);
    }

    #[test]
    fn test_build_outbound_drops_default_port_from_host() {
        let outbound = build_outbound(request(Method::GET, "http://example.org:80/")).unwrap();
        assert_eq!(outbound.headers()[HOST], "example.org");
    }

    #[test]
    fn test_build_outbound_rejects_origin_form() {
        let result = build_outbound(request(Method::GET, "/foo"));
        assert!(matches!(result, Err(ProxyError::BadTarget(_))));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_round_trip() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let forwarder = HttpForwarder::new(SharedTransport::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            forwarder.forward(request(Method::GET, &format!("http://{}/slow", addr)), &cancel),
        )
        .await
        .expect("forward should return once cancelled");
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }
}
