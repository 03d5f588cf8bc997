//! CONNECT tunnels: raw socket takeover and duplex byte relaying.

use crate::config::TeardownPolicy;
use crate::error::ProxyError;
use crate::prebuffered::Prebuffered;
use bytes::Bytes;
use http::uri::Authority;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// A client socket released from the HTTP layer.
pub struct DetachedSocket {
    pub stream: TcpStream,
    /// Bytes the HTTP layer read from the socket but did not consume.
    pub prebuffered: Bytes,
}

/// Capability of an inbound connection to hand over its raw socket.
pub trait RawTakeover {
    fn take_over(self) -> Result<DetachedSocket, ProxyError>;
}

impl RawTakeover for DetachedSocket {
    fn take_over(self) -> Result<DetachedSocket, ProxyError> {
        Ok(self)
    }
}

impl RawTakeover for Prebuffered<TcpStream> {
    fn take_over(self) -> Result<DetachedSocket, ProxyError> {
        let (prebuffered, stream) = self.into_parts();
        Ok(DetachedSocket { stream, prebuffered })
    }
}

/// Connections owned by the HTTP server; their socket cannot be detached.
pub struct NoTakeover;

impl RawTakeover for NoTakeover {
    fn take_over(self) -> Result<DetachedSocket, ProxyError> {
        Err(ProxyError::NotSupported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToTarget,
    TargetToClient,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

#[derive(Debug, Clone)]
pub struct TunnelEstablisher {
    connect_timeout: Duration,
    teardown: TeardownPolicy,
}

impl TunnelEstablisher {
    pub fn new(connect_timeout: Duration, teardown: TeardownPolicy) -> Self {
        Self { connect_timeout, teardown }
    }

    /// Runs a tunnel to `target` (`host:port`) over the detached client socket.
    ///
    /// Fails with `NotSupported` before touching the socket when `conn` cannot
    /// be detached, and with `Dial` after writing a raw 502 when the target is
    /// unreachable. Once the 200 greeting is out, relay errors are only logged.
    pub async fn establish<T: RawTakeover>(&self, target: &str, conn: T) -> Result<TunnelStats, ProxyError> {
        let DetachedSocket { mut stream, prebuffered } = conn.take_over()?;

        let upstream = match self.dial(target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Failed to connect to target {}: {}", target, e);
                if let Err(write_err) = stream.write_all(BAD_GATEWAY).await {
                    debug!("Could not report dial failure to client: {}", write_err);
                }
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        stream.write_all(CONNECTION_ESTABLISHED).await?;
        info!("Tunnel established to {}", target);

        let stats = self.relay(stream, prebuffered, upstream).await;
        info!(
            "TCP tunnel closed for {} (client -> target: {} bytes, target -> client: {} bytes)",
            target, stats.client_to_target, stats.target_to_client
        );
        Ok(stats)
    }

    async fn dial(&self, target: &str) -> Result<TcpStream, ProxyError> {
        let dial_error = |reason: String| ProxyError::Dial {
            target: target.to_string(),
            reason,
        };
        let (host, port) = parse_authority(target).map_err(dial_error)?;

        match timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(dial_error(e.to_string())),
            Err(_) => Err(dial_error(format!("connect timed out after {:?}", self.connect_timeout))),
        }
    }

    async fn relay(&self, client: TcpStream, prebuffered: Bytes, target: TcpStream) -> TunnelStats {
        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target.into_split();
        if !prebuffered.is_empty() {
            debug!("Replaying {} pre-buffered bytes to target", prebuffered.len());
        }
        // Pre-buffered bytes go out ahead of anything read later from the client.
        let client_read = Prebuffered::with_buffer(client_read, prebuffered);

        let half_close = self.teardown == TeardownPolicy::HalfClose;
        let client_to_target_bytes = Arc::new(AtomicU64::new(0));
        let target_to_client_bytes = Arc::new(AtomicU64::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(2);
        let client_to_target = tokio::spawn(copy_direction(
            client_read,
            target_write,
            Direction::ClientToTarget,
            half_close,
            client_to_target_bytes.clone(),
            done_tx.clone(),
        ));
        let target_to_client = tokio::spawn(copy_direction(
            target_read,
            client_write,
            Direction::TargetToClient,
            half_close,
            target_to_client_bytes.clone(),
            done_tx,
        ));

        match self.teardown {
            TeardownPolicy::FirstFinisher => {
                if let Some((direction, result)) = done_rx.recv().await {
                    report(direction, result);
                }
                client_to_target.abort();
                target_to_client.abort();
            }
            TeardownPolicy::HalfClose => {
                while let Some((direction, result)) = done_rx.recv().await {
                    report(direction, result);
                }
            }
        }

        // Both halves of each socket are dropped once the tasks are gone.
        let _ = client_to_target.await;
        let _ = target_to_client.await;
        TunnelStats {
            client_to_target: client_to_target_bytes.load(Ordering::Relaxed),
            target_to_client: target_to_client_bytes.load(Ordering::Relaxed),
        }
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    half_close: bool,
    relayed: Arc<AtomicU64>,
    done: mpsc::Sender<(Direction, io::Result<()>)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_counted(&mut reader, &mut writer, &relayed).await;
    if half_close {
        let _ = writer.shutdown().await;
    }
    let _ = done.send((direction, result)).await;
}

/// Copies until EOF, adding every chunk written to `relayed` as it goes so
/// the count stays accurate if the task is aborted.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, relayed: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        relayed.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn report(direction: Direction, result: io::Result<()>) {
    match result {
        Ok(()) => debug!("{:?} reached EOF", direction),
        Err(e) => warn!("Error in {:?} tunnel relay: {}", direction, e),
    }
}

/// Splits a CONNECT target into host and port. The port is mandatory.
pub fn parse_authority(target: &str) -> Result<(String, u16), String> {
    let authority: Authority = target
        .parse()
        .map_err(|e| format!("invalid authority {:?}: {}", target, e))?;
    let port = authority
        .port_u16()
        .ok_or_else(|| format!("missing port in {:?}", target))?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("missing host in {:?}", target));
    }
    Ok((host.to_string(), port))
}
