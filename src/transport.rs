//! The dial side of the RPC framework stand-in (spec §1: "the core
//! assumes a streams-capable, TLS-capable, request/response RPC runtime
//! exists"). [`RpcTransport`]/[`RpcConnection`] are the seam; everything
//! in this file is one concrete implementation over TCP + mutual TLS +
//! the framing in [`crate::wire`].
//!
//! Grounded on the teacher's `tunnel::client::connect_and_run` (timed TCP
//! connect, timed TLS handshake, `socket2` keepalive/nodelay tuning).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::Error;
use crate::wire::{self, Frame, MsgType, PingRequest, PingResponse};

/// Something that can dial a peer address and hand back a connection
/// capable of the single RPC this fabric needs: `Ping`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RpcConnection>, Error>;
}

/// A live connection to one peer.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    async fn ping(&self, req: PingRequest, timeout: Duration) -> Result<PingResponse, Error>;
}

/// A duplex byte stream, erased so [`TcpRpcConnection`] doesn't need to
/// be generic over `tokio_rustls::client::TlsStream<TcpStream>` directly.
trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// Mutual-TLS transport over TCP.
pub struct TcpRpcTransport {
    connector: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    compression_enabled: bool,
    tcp_keepalive: Option<Duration>,
    tcp_nodelay: bool,
}

impl TcpRpcTransport {
    pub fn new(connector: TlsConnector, compression_enabled: bool) -> Self {
        Self {
            connector,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            compression_enabled,
            tcp_keepalive: Some(Duration::from_secs(60)),
            tcp_nodelay: true,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    fn configure_socket(&self, stream: &TcpStream) {
        let sock_ref = socket2::SockRef::from(stream);
        if let Some(keepalive) = self.tcp_keepalive {
            let ka = socket2::TcpKeepalive::new()
                .with_time(keepalive)
                .with_interval(Duration::from_secs(5));
            if let Err(e) = sock_ref.set_tcp_keepalive(&ka) {
                tracing::warn!(error = %e, "failed to set TCP keepalive");
            }
        }
        if self.tcp_nodelay {
            if let Err(e) = sock_ref.set_nodelay(true) {
                tracing::warn!(error = %e, "failed to set TCP_NODELAY");
            }
        }
    }
}

#[async_trait]
impl RpcTransport for TcpRpcTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RpcConnection>, Error> {
        let host = addr
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| addr.to_string());

        let tcp_stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Transport {
                addr: addr.to_string(),
                source: anyhow::anyhow!(
                    "TCP connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ),
            })?
            .map_err(|e| Error::Transport {
                addr: addr.to_string(),
                source: e.into(),
            })?;

        self.configure_socket(&tcp_stream);

        let server_name = ServerName::try_from(host.clone()).map_err(|e| Error::Transport {
            addr: addr.to_string(),
            source: anyhow::anyhow!("invalid server name {host}: {e}"),
        })?;

        let mut tls_stream = tokio::time::timeout(
            self.handshake_timeout,
            self.connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| Error::Transport {
            addr: addr.to_string(),
            source: anyhow::anyhow!(
                "TLS handshake timed out after {}s",
                self.handshake_timeout.as_secs()
            ),
        })?
        .map_err(|e| Error::Transport {
            addr: addr.to_string(),
            source: e.into(),
        })?;

        negotiate_compression(&mut tls_stream, self.compression_enabled, addr).await?;

        debug!(addr, "dialed and handshook peer");

        Ok(Arc::new(TcpRpcConnection {
            addr: addr.to_string(),
            stream: Mutex::new(Box::new(tls_stream)),
            compression_enabled: self.compression_enabled,
        }))
    }
}

/// Exchange a single compression-capability byte right after the TLS
/// handshake completes (spec §4.1: "enabled symmetrically — the server
/// advertises support during handshake; a client dialling a
/// compression-enabled server with compression disabled is a
/// configuration error reported at dial time").
async fn negotiate_compression<S>(
    stream: &mut S,
    local_enabled: bool,
    addr: &str,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_u8(local_enabled as u8)
        .await
        .map_err(|e| Error::Transport {
            addr: addr.to_string(),
            source: e.into(),
        })?;
    let remote_enabled = stream.read_u8().await.map_err(|e| Error::Transport {
        addr: addr.to_string(),
        source: e.into(),
    })? != 0;

    if remote_enabled && !local_enabled {
        return Err(Error::Transport {
            addr: addr.to_string(),
            source: anyhow::anyhow!(
                "peer advertises rpc_compression but it is disabled locally"
            ),
        });
    }
    Ok(())
}

/// A dialed connection: a single mutex-guarded duplex stream, since this
/// fabric's only caller of `ping` is the one heartbeat loop that owns the
/// connection (spec §5: "Ping calls inside the heartbeat loop are the
/// only other blocking operation").
struct TcpRpcConnection {
    addr: String,
    stream: Mutex<Box<dyn DuplexStream>>,
    compression_enabled: bool,
}

#[async_trait]
impl RpcConnection for TcpRpcConnection {
    async fn ping(&self, req: PingRequest, timeout: Duration) -> Result<PingResponse, Error> {
        let addr = self.addr.clone();
        let fut = self.ping_inner(req);
        if timeout.is_zero() {
            return fut.await;
        }
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                addr,
                elapsed_ms: timeout.as_millis() as u64,
            })?
    }
}

impl TcpRpcConnection {
    async fn ping_inner(&self, req: PingRequest) -> Result<PingResponse, Error> {
        let mut payload = serde_json::to_vec(&req).map_err(|e| Error::Transport {
            addr: req.node_addr.clone(),
            source: e.into(),
        })?;
        let mut frame_flags = 0u8;
        if self.compression_enabled {
            payload = crate::compress::compress(&payload)?;
            frame_flags |= wire::flags::COMPRESSED;
        }
        let frame = Frame::new(MsgType::PingRequest, frame_flags, payload);

        let mut guard = self.stream.lock().await;
        write_frame(&mut *guard, &frame)
            .await
            .map_err(|e| Error::Transport {
                addr: req.node_addr.clone(),
                source: e.into(),
            })?;
        let response_frame = read_frame(&mut *guard).await.map_err(|e| Error::Transport {
            addr: req.node_addr.clone(),
            source: e.into(),
        })?;
        drop(guard);

        if response_frame.msg_type != MsgType::PingResponse {
            return Err(Error::Transport {
                addr: req.node_addr,
                source: anyhow::anyhow!("expected PingResponse, got {:?}", response_frame.msg_type),
            });
        }

        let raw = if response_frame.is_compressed() {
            crate::compress::decompress(&response_frame.payload)?
        } else {
            response_frame.payload.to_vec()
        };

        serde_json::from_slice(&raw).map_err(|e| Error::Transport {
            addr: self.addr.clone(),
            source: e.into(),
        })
    }
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &Frame,
) -> std::io::Result<()> {
    stream.write_all(&frame.encode()).await
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Frame> {
    let mut header = [0u8; wire::HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let payload_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    let mut full = Vec::with_capacity(wire::HEADER_SIZE + payload_len);
    full.extend_from_slice(&header);
    full.extend_from_slice(&payload);
    Frame::decode(bytes::Bytes::from(full))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
