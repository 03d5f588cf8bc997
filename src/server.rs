//! Listener and per-connection front.
//!
//! Every accepted connection gets its own task. The first request head is
//! peeked without consuming it: a CONNECT hands the raw socket (and whatever
//! the client already sent past the head) to the tunnel establisher, anything
//! else is served by hyper's HTTP/1.1 server with the [`Dispatcher`] as service.

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Route, classify};
use crate::error::ProxyError;
use crate::prebuffered::Prebuffered;
use crate::transport::SharedTransport;
use crate::tunnel::TunnelEstablisher;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MAX_PEEKED_HEADERS: usize = 64;

/// Request line of a peeked head plus the length of the whole head section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub len: usize,
}

/// Parses a request head from `buf`; `Ok(None)` while incomplete.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PEEKED_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            len,
        })),
    }
}

/// Buffers until the first request head is complete.
///
/// Returns `Ok(None)` when the head cannot be classified here (malformed,
/// too large, or cut short); the HTTP server then reads the same bytes and
/// answers with its own error. Fails only if the peer closes before sending
/// anything.
pub async fn peek_request_head(conn: &mut Prebuffered<TcpStream>) -> io::Result<Option<RequestHead>> {
    loop {
        let n = conn.buffer_more().await?;
        match parse_request_head(conn.buffer()) {
            Ok(Some(head)) => return Ok(Some(head)),
            Ok(None) => {}
            Err(e) => {
                debug!("Unparsable request head: {}", e);
                return Ok(None);
            }
        }
        if conn.is_full() {
            return Ok(None);
        }
        if n == 0 {
            if conn.buffer().is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed before sending a request"));
            }
            return Ok(None);
        }
    }
}

/// Limits applied while reading client request heads.
#[derive(Debug, Clone, Copy)]
struct HeadLimits {
    max_size: usize,
    read_timeout: Duration,
}

pub struct ProxyServer {
    listen_addr: SocketAddr,
    head_limits: HeadLimits,
    dispatcher: Dispatcher,
}

impl ProxyServer {
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        config.validate()?;
        let transport = SharedTransport::new(config.transport_settings());
        let tunnels = TunnelEstablisher::new(
            Duration::from_secs(config.connect_timeout_secs),
            config.tunnel_teardown,
        );
        debug!(
            "Transport: max idle {}, idle timeout {}s, TLS handshake timeout {}s; tunnel teardown {:?}",
            config.pool_max_idle, config.idle_timeout_secs, config.tls_handshake_timeout_secs, config.tunnel_teardown
        );

        Ok(Self {
            listen_addr: config.listen_addr,
            head_limits: HeadLimits {
                max_size: config.max_header_size,
                read_timeout: Duration::from_secs(config.header_read_timeout_secs),
            },
            dispatcher: Dispatcher::new(transport, tunnels),
        })
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Binding TCP listener to: {}", self.listen_addr);
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from an already bound listener until it fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        info!("HTTP forward proxy listening on: http://{}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let head_limits = self.head_limits;
            tokio::spawn(async move {
                debug!("Connection established from: {}", remote_addr);
                handle_connection(dispatcher, stream, head_limits, remote_addr).await;
                debug!("Connection from {} closed", remote_addr);
            });
        }
    }
}

async fn handle_connection(dispatcher: Dispatcher, stream: TcpStream, limits: HeadLimits, remote_addr: SocketAddr) {
    let mut conn = Prebuffered::new(stream, limits.max_size);
    let head = match timeout(limits.read_timeout, peek_request_head(&mut conn)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!("No request from {}: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            debug!("No complete request head from {} within {:?}", remote_addr, limits.read_timeout);
            return;
        }
    };

    match head {
        Some(head) if classify(&head.method) == Route::Tunnel => {
            conn.discard(head.len);
            info!("CONNECT request to {} from {}", head.target, remote_addr);
            if let Err(e) = dispatcher.tunnels().establish(&head.target, conn).await {
                warn!("Tunnel to {} for {} failed: {}", head.target, remote_addr, e);
            }
        }
        _ => serve_http(dispatcher, conn, limits.read_timeout, remote_addr).await,
    }
}

async fn serve_http(dispatcher: Dispatcher, conn: Prebuffered<TcpStream>, header_timeout: Duration, remote_addr: SocketAddr) {
    // Cancelled once the connection is finished. A client that disconnects
    // mid-request also drops the in-flight service future, which releases the
    // upstream round trip with it.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.handle(req, cancel).await }
    });

    if let Err(e) = ServerBuilder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(conn), service)
        .await
    {
        debug!("Error serving HTTP connection from {}: {}", remote_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_connect_head() {
        let buf = b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n\x16\x03\x01";
        let head = parse_request_head(buf).unwrap().unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.org:443");
        assert_eq!(&buf[head.len..], b"\x16\x03\x01");
    }

    #[test]
    fn test_parse_partial_head() {
        assert_eq!(parse_request_head(b"GET http://example.com/ HTTP/1.1\r\nHost: ex").unwrap(), None);
    }

    #[test]
    fn test_parse_garbage_head() {
        assert!(parse_request_head(b"\x00\x01\x02 nonsense\r\n\r\n").is_err());
    }

    async fn connected_pair(max_header_size: usize) -> (TcpStream, Prebuffered<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), Prebuffered::new(accepted.unwrap().0, max_header_size))
    }

    #[tokio::test]
    async fn test_peek_keeps_bytes_after_head() {
        let (mut client, mut conn) = connected_pair(1024).await;
        client
            .write_all(b"CONNECT example.org:443 HTTP/1.1\r\n\r\nhello")
            .await
            .unwrap();

        let head = peek_request_head(&mut conn).await.unwrap().unwrap();
        assert_eq!(head.method, "CONNECT");
        // Nothing is consumed by peeking.
        assert!(conn.buffer().starts_with(b"CONNECT"));
    }

    #[tokio::test]
    async fn test_peek_gives_up_on_oversized_head() {
        let (mut client, mut conn) = connected_pair(32).await;
        client
            .write_all(b"GET http://example.com/a/very/long/path HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(peek_request_head(&mut conn).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_peek_fails_on_silent_close() {
        let (client, mut conn) = connected_pair(1024).await;
        drop(client);
        assert!(peek_request_head(&mut conn).await.is_err());
    }

    async fn stalled_client_is_dropped(sent: &[u8]) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let (stream, remote_addr) = accepted.unwrap();
        client.write_all(sent).await.unwrap();

        let dispatcher = Dispatcher::new(
            SharedTransport::default(),
            TunnelEstablisher::new(Duration::from_secs(1), Default::default()),
        );
        let limits = HeadLimits {
            max_size: 1024,
            read_timeout: Duration::from_millis(100),
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            handle_connection(dispatcher, stream, limits, remote_addr),
        )
        .await
        .expect("connection should be dropped after the head deadline");

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_silent_client_hits_head_deadline() {
        stalled_client_is_dropped(b"").await;
    }

    #[tokio::test]
    async fn test_partial_head_hits_head_deadline() {
        stalled_client_is_dropped(b"GET http://example.com/ HTTP/1.1\r\nHost: exa").await;
    }
}
